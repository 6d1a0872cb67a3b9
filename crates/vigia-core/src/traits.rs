use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::AppError;
use crate::model::{
    CaseContext, CaseFileSummary, NewJobLogEntry, RawBinnacle, ScrapeOutcome, Snapshot,
    SnapshotSummary, TenantSchedule,
};

/// Browser-backed access to the portal.
///
/// One session equals one exclusive page, leased from the browser pool for
/// the duration of a job; dropping the session returns it on every
/// control-flow path. `fetch_case` drives the full form flow — navigation,
/// antibot interposition retries, CAPTCHA chain, submission, result
/// classification and extraction — and surfaces the classified outcome as
/// a typed error (`InvalidCaseNumber`, `CaptchaFailed`, `BotDetected`,
/// `PortalUnreachable`).
pub trait Portal: Send + Sync {
    type Session: Send;

    fn open(&self) -> impl Future<Output = Result<Self::Session, AppError>> + Send;

    fn fetch_case(
        &self,
        session: &mut Self::Session,
        case_number: &str,
        party_name: &str,
    ) -> impl Future<Output = Result<Vec<RawBinnacle>, AppError>> + Send;

    /// Download one attachment while the session is still on the detail
    /// view. Returns `None` (never an error) when the portal refuses the
    /// download.
    fn download_file(
        &self,
        session: &mut Self::Session,
        url: &str,
    ) -> impl Future<Output = Result<Option<PathBuf>, AppError>> + Send;
}

/// Blob storage for downloaded attachments.
pub trait ObjectStore: Send + Sync + Clone {
    /// Upload a local file under the given key. Returns the stored size in
    /// bytes.
    fn put_file(
        &self,
        local: &Path,
        key: &str,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;
}

/// Repository surface the worker needs: per-case reads plus the single
/// transactional write of a scrape outcome.
pub trait ScrapeStore: Send + Sync + Clone {
    /// Case file, tenant and already-stored attachment names in one round
    /// trip.
    fn case_context(
        &self,
        case_file_id: Uuid,
    ) -> impl Future<Output = Result<CaseContext, AppError>> + Send;

    fn snapshot(
        &self,
        case_file_id: Uuid,
    ) -> impl Future<Output = Result<Option<Snapshot>, AppError>> + Send;

    /// Persist a scrape as one unit of work: binnacle upserts, notification
    /// inserts, attachment records, snapshot upsert, change-log entries and
    /// the case-file stamp all commit or roll back together.
    fn persist_scrape(
        &self,
        outcome: &ScrapeOutcome,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Permanently disable scanning for a case the portal does not know.
    fn mark_scan_invalid(
        &self,
        case_file_id: Uuid,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record a failed attempt on the snapshot (`last_error`,
    /// `error_count`). A no-op while no snapshot exists.
    fn record_scrape_error(
        &self,
        case_file_id: Uuid,
        error_kind: &str,
        error_message: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Repository surface the scheduler needs.
pub trait PlanStore: Send + Sync + Clone {
    /// Enabled portal-monitoring schedules joined to tenants with scraping
    /// on.
    fn monitoring_schedules(
        &self,
    ) -> impl Future<Output = Result<Vec<TenantSchedule>, AppError>> + Send;

    /// Case files eligible for scraping: enabled, scan-valid, not archived.
    fn eligible_case_files(
        &self,
        tenant_id: Uuid,
    ) -> impl Future<Output = Result<Vec<CaseFileSummary>, AppError>> + Send;

    /// Batch-load snapshot timestamps for the given case files.
    fn snapshots_for(
        &self,
        case_file_ids: &[Uuid],
    ) -> impl Future<Output = Result<HashMap<Uuid, SnapshotSummary>, AppError>> + Send;
}

/// Append-only log of job attempts.
pub trait JobLog: Send + Sync + Clone {
    fn record(
        &self,
        entry: NewJobLogEntry,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}
