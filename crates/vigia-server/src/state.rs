use std::time::Instant;

use chrono_tz::Tz;
use metrics_exporter_prometheus::PrometheusHandle;

use vigia_core::rate_limit::RateLimitedJobStore;
use vigia_db::{Database, JobRepository};
use vigia_portal::BrowserPool;

/// Shared application state, available to all route handlers via
/// `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Database,
    pub jobs: RateLimitedJobStore<JobRepository>,
    /// Absent in tests that run without a browser.
    pub pool: Option<BrowserPool>,
    pub service_secret: String,
    pub timezone: Tz,
    pub started_at: Instant,
    /// Prometheus render handle; absent when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}
