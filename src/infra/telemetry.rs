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

/// Register descriptions for every metric the sync layer emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "marketsync_query_hit_total",
            Unit::Count,
            "Reads answered from a fresh cache entry."
        );
        describe_counter!(
            "marketsync_query_miss_total",
            Unit::Count,
            "Reads that started a new fetch."
        );
        describe_counter!(
            "marketsync_query_dedup_total",
            Unit::Count,
            "Reads attached to a fetch already in flight."
        );
        describe_counter!(
            "marketsync_fetch_error_total",
            Unit::Count,
            "Fetches that ended in an error."
        );
        describe_counter!(
            "marketsync_mutation_total",
            Unit::Count,
            "Settled mutations, labelled by outcome."
        );
        describe_histogram!(
            "marketsync_mutation_ms",
            Unit::Milliseconds,
            "Mutation latency from start to settle in milliseconds."
        );
        describe_counter!(
            "marketsync_patch_revert_total",
            Unit::Count,
            "Optimistic patches reverted after a rejected mutation."
        );
        describe_counter!(
            "marketsync_patch_conflict_total",
            Unit::Count,
            "Reverts skipped because newer data replaced the patched value."
        );
        describe_counter!(
            "marketsync_invalidation_refetch_total",
            Unit::Count,
            "Subscribed entries refetched after tag invalidation."
        );
        describe_counter!(
            "marketsync_invalidation_stale_total",
            Unit::Count,
            "Unsubscribed entries marked stale after tag invalidation."
        );
        describe_histogram!(
            "marketsync_invalidation_ms",
            Unit::Milliseconds,
            "Time for an invalidation and its refetches to settle in milliseconds."
        );
        describe_counter!(
            "marketsync_evict_total",
            Unit::Count,
            "Cache entries evicted after their last subscriber left."
        );
        describe_counter!(
            "marketsync_event_dropped_total",
            Unit::Count,
            "Sync events dropped from the bounded journal."
        );
        describe_gauge!(
            "marketsync_entries",
            Unit::Count,
            "Current number of cache entries."
        );
    });
}
