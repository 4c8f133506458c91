//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU64, path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    DEFAULT_BACKEND_TTL_SECS, DEFAULT_EXPIRATION_HOURS, DEFAULT_INVALIDATE_TTL_SECS,
    DEFAULT_MITIGATE_AT_MINUTES,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "herdcache";
const ENV_PREFIX: &str = "HERDCACHE";
// Keeps `now + lifetime` well inside the representable timestamp range.
const MAX_CACHE_LIFETIME_HOURS: u64 = 24 * 365 * 100;

/// Command-line arguments for the demo binary.
#[derive(Debug, Parser)]
#[command(
    name = "herdcache-demo",
    version,
    about = "Stampede-safe caching demo"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "HERDCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the follower scenario against in-memory collaborators.
    Scenario,
    /// Print the backend key for a logical cache key.
    Hash {
        /// Logical key, e.g. `followers.Account::1`.
        key: String,
    },
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the cache key namespace prefix.
    #[arg(long = "key-prefix", value_name = "PREFIX")]
    pub key_prefix: Option<String>,

    /// Override the logical expiry of cache entries.
    #[arg(long = "expiration-hours", value_name = "HOURS")]
    pub expiration_hours: Option<u64>,

    /// Override the stampede-mitigation window.
    #[arg(long = "mitigate-at-minutes", value_name = "MINUTES")]
    pub mitigate_at_minutes: Option<u64>,

    /// Override the backend eviction TTL (0 disables it).
    #[arg(long = "backend-ttl-seconds", value_name = "SECONDS")]
    pub backend_ttl_secs: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub key_prefix: String,
    pub expiration_hours: NonZeroU64,
    pub mitigate_at_minutes: u64,
    pub backend_ttl_secs: u64,
    pub invalidate_ttl_secs: NonZeroU64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(prefix) = overrides.key_prefix.as_ref() {
            self.cache.key_prefix = Some(prefix.clone());
        }
        if let Some(hours) = overrides.expiration_hours {
            self.cache.expiration_hours = Some(hours);
        }
        if let Some(minutes) = overrides.mitigate_at_minutes {
            self.cache.mitigate_at_minutes = Some(minutes);
        }
        if let Some(seconds) = overrides.backend_ttl_secs {
            self.cache.backend_ttl_secs = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let key_prefix = cache.key_prefix.unwrap_or_default();
    let expiration_hours = non_zero(
        cache.expiration_hours.unwrap_or(DEFAULT_EXPIRATION_HOURS),
        "cache.expiration_hours",
    )?;
    at_most(
        expiration_hours.get(),
        MAX_CACHE_LIFETIME_HOURS,
        "cache.expiration_hours",
    )?;
    let mitigate_at_minutes = at_most(
        cache
            .mitigate_at_minutes
            .unwrap_or(DEFAULT_MITIGATE_AT_MINUTES),
        MAX_CACHE_LIFETIME_HOURS * 60,
        "cache.mitigate_at_minutes",
    )?;
    if mitigate_at_minutes.saturating_mul(60) >= expiration_hours.get().saturating_mul(3600) {
        return Err(LoadError::invalid(
            "cache.mitigate_at_minutes",
            "mitigation window must be shorter than the expiration",
        ));
    }
    let invalidate_ttl_secs = non_zero(
        cache
            .invalidate_ttl_secs
            .unwrap_or(DEFAULT_INVALIDATE_TTL_SECS),
        "cache.invalidate_ttl_secs",
    )?;
    at_most(
        invalidate_ttl_secs.get(),
        MAX_CACHE_LIFETIME_HOURS * 3600,
        "cache.invalidate_ttl_secs",
    )?;
    let backend_ttl_secs = at_most(
        cache.backend_ttl_secs.unwrap_or(DEFAULT_BACKEND_TTL_SECS),
        MAX_CACHE_LIFETIME_HOURS * 3600,
        "cache.backend_ttl_secs",
    )?;

    Ok(CacheSettings {
        key_prefix,
        expiration_hours,
        mitigate_at_minutes,
        backend_ttl_secs,
        invalidate_ttl_secs,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    key_prefix: Option<String>,
    expiration_hours: Option<u64>,
    mitigate_at_minutes: Option<u64>,
    backend_ttl_secs: Option<u64>,
    invalidate_ttl_secs: Option<u64>,
}

fn non_zero(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn at_most(value: u64, max: u64, key: &'static str) -> Result<u64, LoadError> {
    if value > max {
        return Err(LoadError::invalid(key, format!("must be at most {max}")));
    }
    Ok(value)
}
