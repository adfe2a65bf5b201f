use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::{CacheError, CacheResult};

/// Overrides `logging.level` with a full filter directive, e.g.
/// `GRANULE_LOG=granule::cache::dogpile=debug`.
pub const FILTER_ENV_VAR: &str = "GRANULE_LOG";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Installs the process-wide tracing subscriber and describes the cache
/// counters. Fails with a configuration error when a subscriber is already
/// installed.
pub fn init(logging: &LoggingSettings) -> CacheResult<()> {
    describe_metrics();

    let filter = EnvFilter::builder()
        .with_env_var(FILTER_ENV_VAR)
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(fmt_layer(logging.format))
        .try_init()
        .map_err(|err| {
            CacheError::configuration(format!("tracing subscriber already installed: {err}"))
        })
}

// Lock waits and recomputations happen on caller threads, so every line
// carries the thread it came from.
fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_target(false)
            .boxed(),
    }
}

/// Registers descriptions for every counter the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "granule_cache_hit_total",
            Unit::Count,
            "Total number of cache hits, labelled by layer (local or store)."
        );
        describe_counter!(
            "granule_cache_miss_total",
            Unit::Count,
            "Total number of cache misses that recomputed the value."
        );
        describe_counter!(
            "granule_cache_lock_wait_total",
            Unit::Count,
            "Total number of reads that waited on another caller's recomputation."
        );
        describe_counter!(
            "granule_cache_write_skipped_total",
            Unit::Count,
            "Total number of computed values not stored, labelled by reason."
        );
        describe_counter!(
            "granule_invalidation_total",
            Unit::Count,
            "Total number of invalidations, labelled by kind (fields, table or all)."
        );
        describe_counter!(
            "granule_reap_removed_total",
            Unit::Count,
            "Total number of dead registrations removed from conjunction sets."
        );
    });
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::*;

    #[test]
    fn second_install_is_a_configuration_error() {
        let logging = LoggingSettings {
            level: LevelFilter::WARN,
            format: LogFormat::Compact,
        };

        // The first call may lose to another test's subscriber; the second
        // always finds one in place.
        let _ = init(&logging);
        let err = init(&logging).expect_err("second install must fail");
        assert!(matches!(err, CacheError::Configuration { .. }));
        assert!(err.to_string().contains("already installed"));
    }
}
