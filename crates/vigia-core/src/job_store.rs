use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{EnqueueRequest, JobState, Lane, ScrapeJob};

/// Per-lane queue depth, reported by `/status`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LaneCounts {
    pub pending: i64,
    pub active: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Durable three-lane prioritized job queue.
///
/// Implementations must support atomic claiming via
/// `SELECT FOR UPDATE SKIP LOCKED` or equivalent so concurrent workers
/// never claim the same job, and must enforce dedup-key uniqueness across
/// the non-terminal states (pending/active/delayed) atomically under
/// concurrent producers.
pub trait JobStore: Send + Sync + Clone {
    /// Enqueue a job, or return the id of the existing job holding the same
    /// dedup key in a non-terminal state. Completed and failed jobs never
    /// block a re-enqueue.
    fn enqueue(
        &self,
        request: EnqueueRequest,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    /// Atomically claim the next ready job across the given lanes.
    ///
    /// Ordering: lane rank (PRIORITY > INITIAL > MONITOR), then priority
    /// number ascending, then enqueue order. Delayed jobs become ready once
    /// their retry time has passed. Claiming increments the job's attempt
    /// counter. Returns `None` if no job is ready.
    fn next_ready(
        &self,
        worker_id: &str,
        lanes: &[Lane],
    ) -> impl Future<Output = Result<Option<ScrapeJob>, AppError>> + Send;

    fn complete(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record a failed attempt. With `retry_at` set the job is parked in
    /// `delayed` state until then; otherwise it is marked permanently
    /// `failed`.
    fn fail(
        &self,
        job_id: Uuid,
        error_kind: &str,
        error_message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Return all jobs a worker still holds to `pending` (graceful or
    /// forced shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn count(
        &self,
        lane: Lane,
        state: JobState,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;

    /// Queue depth for every lane in one call.
    fn lane_counts(
        &self,
    ) -> impl Future<Output = Result<std::collections::HashMap<Lane, LaneCounts>, AppError>> + Send;
}
