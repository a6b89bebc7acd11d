//! Logging and metrics setup.
//!
//! The decoder itself only emits `tracing` events and `metrics` records;
//! installing a subscriber or a metrics recorder is left to the embedding
//! application. [`init_tracing`] covers the common case of the command line
//! tool.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry};

use crate::config::LoggingConfig;
use crate::error::{Result, SearchError};

static METRICS_REGISTERED: OnceCell<()> = OnceCell::new();

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let subscriber = Registry::default().with(env_filter);

    let installed = if config.json {
        subscriber
            .with(fmt::layer().json().with_target(true).with_thread_names(true))
            .try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(true).compact())
            .try_init()
    };
    installed.map_err(|e| SearchError::Config(format!("tracing: {}", e)))?;

    info!(level = %config.level, json = config.json, "Tracing initialized");
    Ok(())
}

/// Describe all decoder metrics. Safe to call more than once.
pub fn register_metrics() {
    METRICS_REGISTERED.get_or_init(|| {
        describe_counter!(
            "wfst_expanded_states_total",
            "Total number of hypotheses expanded by all decoders"
        );
        describe_counter!("wfst_searches_total", "Total number of completed searches");
        describe_counter!(
            "wfst_search_failures_total",
            "Total number of searches aborted by an error"
        );
        describe_gauge!(
            "wfst_search_memory_bytes",
            "Memory held by the pools of the current search"
        );
        describe_histogram!(
            "wfst_search_duration_seconds",
            "Duration of search calls in seconds"
        );
    });
}

/// Record one successful search call.
pub fn record_search(algorithm: &'static str, expanded: u64, memory_bytes: usize, elapsed: Duration, finished: bool) {
    counter!("wfst_expanded_states_total", "algorithm" => algorithm).increment(expanded);
    if finished {
        counter!("wfst_searches_total", "algorithm" => algorithm).increment(1);
    }
    gauge!("wfst_search_memory_bytes").set(memory_bytes as f64);
    histogram!("wfst_search_duration_seconds", "algorithm" => algorithm).record(elapsed.as_secs_f64());
}

/// Record a search call that failed.
pub fn record_failure(algorithm: &'static str, error: &SearchError) {
    counter!(
        "wfst_search_failures_total",
        "algorithm" => algorithm,
        "error" => error.kind()
    )
    .increment(1);
}
