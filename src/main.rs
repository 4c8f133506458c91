use std::{process, sync::Arc};

use herdcache::{
    cache::{CacheBackend, CacheConfig, CacheKey, CacheMachine, CacheRegistry, MemoryBackend},
    config::{self, Command, Settings},
    error::{CacheError, TelemetryError},
    telemetry,
    tweeter::Tweeter,
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum DemoError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

fn main() {
    if let Err(error) = run() {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &DemoError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "demo failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "demo failed");
    });
}

fn run() -> Result<(), DemoError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command.unwrap_or(Command::Scenario) {
        Command::Scenario => run_scenario(&settings),
        Command::Hash { key } => {
            let machine = build_machine(&settings);
            println!("{}", machine.hash(&CacheKey::new(key)));
            Ok(())
        }
    }
}

fn run_scenario(settings: &Settings) -> Result<(), DemoError> {
    let machine = build_machine(settings);
    let app = Tweeter::new(machine, Arc::new(CacheRegistry::new()));

    let report = app.run_scenario()?;
    info!(
        followers_after = report.followers_after,
        mutual_after = report.mutual_after,
        "Scenario complete"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_machine(settings: &Settings) -> Arc<CacheMachine> {
    let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
    Arc::new(CacheMachine::new(
        backend,
        CacheConfig::from(&settings.cache),
    ))
}
