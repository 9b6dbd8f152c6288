use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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

pub(crate) fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "amxforge_batches_total",
            Unit::Count,
            "Total number of compile batches, labelled by outcome."
        );
        describe_counter!(
            "amxforge_units_total",
            Unit::Count,
            "Total number of compiled plugins, labelled by result."
        );
        describe_histogram!(
            "amxforge_compile_ms",
            Unit::Milliseconds,
            "Wall-clock time of a single compiler invocation in milliseconds."
        );
        describe_counter!(
            "amxforge_reclaimed_total",
            Unit::Count,
            "Total number of artifacts removed by the reclaimer, labelled by kind."
        );
        describe_gauge!(
            "amxforge_retention_entries",
            Unit::Count,
            "Current number of batches held in the retention store."
        );
        describe_counter!(
            "amxforge_rate_limited_total",
            Unit::Count,
            "Total number of compile requests refused by the rate limiter."
        );
    });
}
