use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metrics::{
    METRIC_DELETE_TOTAL, METRIC_ERROR_TOTAL, METRIC_HIT_TOTAL, METRIC_MAINTENANCE_MS,
    METRIC_MISS_TOTAL, METRIC_OP_MS, METRIC_SET_TOTAL, METRIC_WARM_MS,
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
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_HIT_TOTAL, Unit::Count, "Total number of cache hits.");
        describe_counter!(
            METRIC_MISS_TOTAL,
            Unit::Count,
            "Total number of cache misses, including undecodable entries."
        );
        describe_counter!(
            METRIC_SET_TOTAL,
            Unit::Count,
            "Total number of successful cache writes."
        );
        describe_counter!(
            METRIC_DELETE_TOTAL,
            Unit::Count,
            "Total number of cache delete calls."
        );
        describe_counter!(
            METRIC_ERROR_TOTAL,
            Unit::Count,
            "Total number of failed store operations."
        );
        describe_histogram!(
            METRIC_OP_MS,
            Unit::Milliseconds,
            "Store operation latency in milliseconds, labelled by operation."
        );
        describe_histogram!(
            METRIC_WARM_MS,
            Unit::Milliseconds,
            "Cache warm phase latency in milliseconds."
        );
        describe_histogram!(
            METRIC_MAINTENANCE_MS,
            Unit::Milliseconds,
            "Background maintenance cycle latency in milliseconds."
        );
    });
}
