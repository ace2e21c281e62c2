// Structured logging and metrics for the application context

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Level used by the process-aware initializer when `RUST_LOG` is unset
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `log_level`. With `json` set, events
/// are written as JSON objects carrying the current span, thread ids and
/// source locations; otherwise the compact human-readable format is used.
/// Fails if a global subscriber is already installed.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    describe_metrics();

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");
    Ok(())
}

/// Install JSON logging unless a subscriber is already in place.
///
/// Safe to call from every process and thread; the first caller wins.
pub fn init_process_aware_logging() -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    match init_logging(DEFAULT_LOG_LEVEL, true) {
        Ok(()) => {
            tracing::info!(pid = std::process::id(), "Process-aware logging initialized");
            Ok(())
        }
        // Lost the race against another initializer
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Register descriptions for every metric this crate records
pub fn describe_metrics() {
    describe_counter!(
        "relay_tasks_published_total",
        "Total number of task messages published to the broker"
    );
    describe_counter!(
        "relay_task_events_failed_total",
        "Total number of task events that could not be dispatched"
    );
    describe_counter!(
        "relay_fork_cleanups_total",
        "Total number of pool resets after a process fork"
    );
    describe_gauge!("relay_pool_in_use", "Pool members currently handed out");
}

#[inline]
pub fn record_task_published(task_name: &str) {
    counter!("relay_tasks_published_total", "task" => task_name.to_string()).increment(1);
}

#[inline]
pub fn record_event_failure(event_type: &str) {
    counter!("relay_task_events_failed_total", "event" => event_type.to_string()).increment(1);
}

#[inline]
pub fn record_fork_cleanup() {
    counter!("relay_fork_cleanups_total").increment(1);
}

/// Set the in-use gauge of the named pool
#[inline]
pub fn update_pool_in_use(pool: &'static str, in_use: usize) {
    gauge!("relay_pool_in_use", "pool" => pool).set(in_use as f64);
}
