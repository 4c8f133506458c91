use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::TelemetryError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            TelemetryError::Install(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for the cache metrics with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "herdcache_hit_total",
            Unit::Count,
            "Total number of cache hits."
        );
        describe_counter!(
            "herdcache_miss_total",
            Unit::Count,
            "Total number of cache misses."
        );
        describe_counter!(
            "herdcache_mitigation_total",
            Unit::Count,
            "Total number of near-expiry refreshes triggered by stampede mitigation."
        );
        describe_counter!(
            "herdcache_backend_error_total",
            Unit::Count,
            "Total number of cache backend failures, labelled by operation."
        );
        describe_counter!(
            "herdcache_invalidate_total",
            Unit::Count,
            "Total number of soft invalidations."
        );
        describe_histogram!(
            "herdcache_memo_compute_ms",
            Unit::Milliseconds,
            "Memoized computation latency in milliseconds."
        );
    });
}
