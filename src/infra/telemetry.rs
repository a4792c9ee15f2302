use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "depcache_hit_total",
            Unit::Count,
            "Total number of computations served from the cache."
        );
        describe_counter!(
            "depcache_miss_total",
            Unit::Count,
            "Total number of computations that ran because no entry was usable."
        );
        describe_counter!(
            "depcache_bypass_total",
            Unit::Count,
            "Total number of computations run without consulting the cache, by reason."
        );
        describe_counter!(
            "depcache_index_evicted_total",
            Unit::Count,
            "Total number of values dropped from oversized index lists."
        );
        describe_counter!(
            "depcache_invalidated_total",
            Unit::Count,
            "Total number of cache entries deleted by change notifications."
        );
        describe_histogram!(
            "depcache_commit_ms",
            Unit::Milliseconds,
            "Registry commit latency in milliseconds."
        );
    });
}
