use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing::Subscriber;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global subscriber and describe the cache metrics.
///
/// `RUST_LOG` still wins over the configured level. Refresh workers run on
/// pool threads, so thread names are logged and closed spans report their
/// busy time.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(output_layer(logging.format))
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn output_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_names(true)
            .boxed(),
    }
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tickvault_cache_hit_total",
            Unit::Count,
            "Total number of cache hits, labelled by tier."
        );
        describe_counter!(
            "tickvault_cache_miss_total",
            Unit::Count,
            "Total number of lookups that missed both tiers."
        );
        describe_counter!(
            "tickvault_cache_evict_total",
            Unit::Count,
            "Total number of hot-tier evictions due to capacity."
        );
        describe_counter!(
            "tickvault_cache_promote_total",
            Unit::Count,
            "Total number of warm-tier hits copied into the hot tier."
        );
        describe_counter!(
            "tickvault_cache_compressed_total",
            Unit::Count,
            "Total number of payloads stored compressed."
        );
        describe_counter!(
            "tickvault_warm_error_total",
            Unit::Count,
            "Total number of warm-tier operations that failed or timed out."
        );
        describe_histogram!(
            "tickvault_cache_op_ms",
            Unit::Milliseconds,
            "Tiered store operation latency in milliseconds."
        );
        describe_gauge!(
            "tickvault_hot_entries",
            Unit::Count,
            "Current number of entries held by the hot tier."
        );
        describe_counter!(
            "tickvault_refresh_scheduled_total",
            Unit::Count,
            "Total number of background refreshes accepted."
        );
        describe_counter!(
            "tickvault_refresh_dropped_total",
            Unit::Count,
            "Total number of background refreshes rejected, labelled by reason."
        );
        describe_counter!(
            "tickvault_refresh_outcome_total",
            Unit::Count,
            "Background refresh attempts, labelled by outcome."
        );
        describe_gauge!(
            "tickvault_refresh_running",
            Unit::Count,
            "Current number of background refreshes holding a slot."
        );
    });
}
