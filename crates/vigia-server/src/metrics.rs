//! Prometheus metrics setup.
//!
//! Counters are recorded through the `metrics` facade wherever the events
//! happen (worker, scheduler); this module installs the process-wide
//! recorder and owns the render handle exposed at `/metrics`.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use vigia_core::error::AppError;

/// Install the Prometheus recorder. Only one recorder can exist per
/// process.
pub fn install() -> Result<PrometheusHandle, AppError> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        AppError::ConfigError(format!("failed to install Prometheus recorder: {e}"))
    })?;

    describe_counter!(
        "vigia_jobs_completed_total",
        "Jobs completed, labeled by lane"
    );
    describe_counter!(
        "vigia_jobs_failed_total",
        "Job attempts failed, labeled by lane and error kind"
    );
    describe_counter!(
        "vigia_scheduler_jobs_enqueued_total",
        "Monitor jobs enqueued by the scheduler"
    );
    describe_counter!(
        "vigia_changes_detected_total",
        "Change-log entries produced by completed jobs"
    );
    describe_histogram!(
        "vigia_scrape_duration_seconds",
        "End-to-end duration of one scrape job"
    );

    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}
