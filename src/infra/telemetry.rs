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

/// Register units and help text for every engine metric.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "sluice_ledger_hit_total",
            Unit::Count,
            "Relation reads answered by a pending delta-ledger entry."
        );
        describe_counter!(
            "sluice_relation_bypass_total",
            Unit::Count,
            "Relation reads sampled to bypass the bitmap and read durable state."
        );
        describe_counter!(
            "sluice_correction_failed_total",
            Unit::Count,
            "Delayed bitmap corrections that could not read or write state."
        );
        describe_counter!(
            "sluice_negative_cache_hit_total",
            Unit::Count,
            "Reads answered by a negative-cache placeholder."
        );
        describe_counter!(
            "sluice_lock_conflict_total",
            Unit::Count,
            "Optimistic-lock conflicts observed on watched keys."
        );
        describe_counter!(
            "sluice_lock_poisoned_total",
            Unit::Count,
            "Poisoned in-process locks recovered after a panic."
        );
        describe_gauge!(
            "sluice_write_back_queue_len",
            Unit::Count,
            "Current number of relation changes waiting for the next flush."
        );
        describe_counter!(
            "sluice_flush_deficit_total",
            Unit::Count,
            "Write-back items that failed to persist during a flush."
        );
        describe_histogram!(
            "sluice_flush_ms",
            Unit::Milliseconds,
            "Write-back flush latency in milliseconds."
        );
    });
}
