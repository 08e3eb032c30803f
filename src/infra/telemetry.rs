use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::batch::METRIC_BATCH_IDS;
use crate::application::mutation::{METRIC_MUTATION_ROLLBACK, METRIC_UNDO_CANCELLED};
use crate::cache::{
    METRIC_CACHE_EVICT, METRIC_CACHE_HIT, METRIC_CACHE_JOIN, METRIC_CACHE_MISS, METRIC_LOADER_MS,
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

/// Register descriptions for every metric the data layer emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of queries answered from a fresh cache entry."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of queries that started a loader call."
        );
        describe_counter!(
            METRIC_CACHE_JOIN,
            Unit::Count,
            "Total number of queries that joined an in-flight load."
        );
        describe_counter!(
            METRIC_CACHE_EVICT,
            Unit::Count,
            "Total number of cache entries evicted due to capacity."
        );
        describe_histogram!(
            METRIC_LOADER_MS,
            Unit::Milliseconds,
            "Loader latency in milliseconds."
        );
        describe_histogram!(
            METRIC_BATCH_IDS,
            Unit::Count,
            "Distinct ids carried by one merged getMany call."
        );
        describe_counter!(
            METRIC_MUTATION_ROLLBACK,
            Unit::Count,
            "Total number of optimistic mutations rolled back after failure."
        );
        describe_counter!(
            METRIC_UNDO_CANCELLED,
            Unit::Count,
            "Total number of undoable mutations cancelled before dispatch."
        );
    });
}
