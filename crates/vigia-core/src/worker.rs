use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::{BreakerError, PortalBreaker};
use crate::diff;
use crate::error::AppError;
use crate::job::{Lane, ScrapeJob, WorkerConfig};
use crate::job_store::JobStore;
use crate::model::{
    ChangeType, NewChangeLogEntry, NewFileAttachment, NewJobLogEntry, JobLogStatus, ScrapeOutcome,
};
use crate::normalize;
use crate::traits::{JobLog, ObjectStore, Portal, ScrapeStore};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    JobClaimed {
        job: &'a ScrapeJob,
    },
    JobCompleted {
        job_id: Uuid,
        binnacles_found: usize,
        changes_detected: usize,
    },
    JobFailed {
        job_id: Uuid,
        error_kind: &'a str,
        error: &'a str,
        will_retry: bool,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for jobs");
            }
            WorkerEvent::JobClaimed { job } => {
                tracing::info!(
                    job_id = %job.id,
                    lane = %job.lane,
                    case_number = %job.case_number,
                    attempt = job.attempt,
                    "Job claimed"
                );
            }
            WorkerEvent::JobCompleted {
                job_id,
                binnacles_found,
                changes_detected,
            } => {
                tracing::info!(%job_id, binnacles_found, changes_detected, "Job completed");
            }
            WorkerEvent::JobFailed {
                job_id,
                error_kind,
                error,
                will_retry,
            } => {
                tracing::warn!(%job_id, %error_kind, %error, %will_retry, "Job failed");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lane concurrency gate
// ---------------------------------------------------------------------------

/// Per-lane concurrency caps shared by all worker tasks of this process.
///
/// A lane at its cap is excluded from the next claim, so one slow lane
/// cannot starve the others of worker slots.
#[derive(Clone)]
pub struct LaneGate {
    caps: Arc<HashMap<Lane, usize>>,
    active: Arc<Mutex<HashMap<Lane, usize>>>,
}

impl LaneGate {
    pub fn new(caps: HashMap<Lane, usize>) -> Self {
        Self {
            caps: Arc::new(caps),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Default caps for a fleet of `worker_concurrency` workers:
    /// MONITOR may fill the fleet, INITIAL half of it, PRIORITY a third —
    /// at least one slot each.
    pub fn with_defaults(worker_concurrency: usize) -> Self {
        let w = worker_concurrency.max(1);
        let caps = HashMap::from([
            (Lane::Monitor, w),
            (Lane::Initial, (w / 2).max(1)),
            (Lane::Priority, (w / 3).max(1)),
        ]);
        Self::new(caps)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<Lane, usize>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Lanes with a free slot, in claim order.
    pub fn open_lanes(&self) -> Vec<Lane> {
        let active = self.lock_active();
        Lane::ALL
            .into_iter()
            .filter(|lane| {
                let cap = self.caps.get(lane).copied().unwrap_or(usize::MAX);
                active.get(lane).copied().unwrap_or(0) < cap
            })
            .collect()
    }

    /// Occupy a slot for a claimed job; the returned guard frees it.
    pub fn begin(&self, lane: Lane) -> LaneSlot {
        *self.lock_active().entry(lane).or_insert(0) += 1;
        LaneSlot {
            gate: self.clone(),
            lane,
        }
    }

    fn finish(&self, lane: Lane) {
        let mut active = self.lock_active();
        if let Some(count) = active.get_mut(&lane) {
            *count = count.saturating_sub(1);
        }
    }
}

/// RAII slot in a [`LaneGate`].
pub struct LaneSlot {
    gate: LaneGate,
    lane: Lane,
}

impl Drop for LaneSlot {
    fn drop(&mut self) {
        self.gate.finish(self.lane);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Summary of one completed job.
#[derive(Debug, Clone, Copy)]
pub struct JobSummary {
    pub binnacles_found: usize,
    pub changes_detected: usize,
}

struct Failure {
    kind: &'static str,
    message: String,
    retryable: bool,
    invalid_case: bool,
}

/// Worker that claims jobs and runs each one to completion: portal scrape,
/// normalization, change detection and transactional persistence.
pub struct WorkerService<J, P, S, O, L>
where
    J: JobStore,
    P: Portal,
    S: ScrapeStore,
    O: ObjectStore,
    L: JobLog,
{
    jobs: J,
    portal: P,
    store: S,
    objects: O,
    job_log: L,
    breaker: PortalBreaker,
    gate: LaneGate,
    config: WorkerConfig,
    attachment_prefix: String,
}

impl<J, P, S, O, L> WorkerService<J, P, S, O, L>
where
    J: JobStore,
    P: Portal,
    S: ScrapeStore,
    O: ObjectStore,
    L: JobLog,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: J,
        portal: P,
        store: S,
        objects: O,
        job_log: L,
        breaker: PortalBreaker,
        gate: LaneGate,
        config: WorkerConfig,
        attachment_prefix: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            portal,
            store,
            objects,
            job_log,
            breaker,
            gate,
            config,
            attachment_prefix: attachment_prefix.into(),
        }
    }

    /// Run the worker loop until cancellation. The in-flight job finishes
    /// before the loop exits; claimed-but-unfinished jobs are released on
    /// the way out.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            let lanes = self.gate.open_lanes();
            if lanes.is_empty() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => continue,
                    () = cancel_token.cancelled() => break,
                }
            }

            match self.jobs.next_ready(&self.config.worker_id, &lanes).await {
                Ok(Some(job)) => {
                    let _slot = self.gate.begin(job.lane);
                    reporter.report(WorkerEvent::JobClaimed { job: &job });
                    self.process_job(&job, reporter).await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: release anything still claimed.
        let released = self
            .jobs
            .release_worker_jobs(&self.config.worker_id)
            .await
            .unwrap_or(0);

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Process a single claimed job to success or terminal failure. Public
    /// for testing purposes.
    pub async fn process_job<WR: WorkerReporter>(&self, job: &ScrapeJob, reporter: &WR) {
        let started_at = Utc::now();

        if let Err(e) = self
            .job_log
            .record(NewJobLogEntry {
                case_file_id: job.case_file_id,
                tenant_id: job.tenant_id,
                lane: job.lane,
                status: JobLogStatus::Started,
                attempt: job.attempt,
                duration_ms: None,
                binnacles_found: None,
                changes_detected: None,
                error_kind: None,
                error_message: None,
                worker_id: Some(self.config.worker_id.clone()),
                started_at,
                completed_at: None,
            })
            .await
        {
            tracing::error!(job_id = %job.id, error = %e, "Failed to write job-start log");
        }

        // Panics inside a job are a job failure, not a process failure.
        let result = std::panic::AssertUnwindSafe(self.breaker.call(|| self.execute(job)))
            .catch_unwind()
            .await;

        let outcome: Result<JobSummary, Failure> = match result {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(BreakerError::Open { retry_after })) => Err(Failure {
                kind: "portal_unreachable",
                message: format!(
                    "portal circuit open; retry after {}s",
                    retry_after.as_secs()
                ),
                retryable: true,
                invalid_case: false,
            }),
            Ok(Err(BreakerError::Inner(e))) => Err(Failure {
                kind: e.kind_code(),
                message: e.to_string(),
                retryable: e.is_retryable(),
                invalid_case: matches!(e, AppError::InvalidCaseNumber),
            }),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic in job".to_string());
                Err(Failure {
                    kind: "unknown",
                    message,
                    retryable: true,
                    invalid_case: false,
                })
            }
        };

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();

        match outcome {
            Ok(summary) => {
                reporter.report(WorkerEvent::JobCompleted {
                    job_id: job.id,
                    binnacles_found: summary.binnacles_found,
                    changes_detected: summary.changes_detected,
                });

                if let Err(e) = self
                    .job_log
                    .record(NewJobLogEntry {
                        case_file_id: job.case_file_id,
                        tenant_id: job.tenant_id,
                        lane: job.lane,
                        status: JobLogStatus::Completed,
                        attempt: job.attempt,
                        duration_ms: Some(duration_ms),
                        binnacles_found: Some(summary.binnacles_found as i32),
                        changes_detected: Some(summary.changes_detected as i32),
                        error_kind: None,
                        error_message: None,
                        worker_id: Some(self.config.worker_id.clone()),
                        started_at,
                        completed_at: Some(completed_at),
                    })
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to write job log");
                }

                if let Err(e) = self.jobs.complete(job.id).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }

                metrics::counter!("vigia_jobs_completed_total", "lane" => job.lane.as_str())
                    .increment(1);
                metrics::histogram!("vigia_scrape_duration_seconds")
                    .record(duration_ms as f64 / 1000.0);
                metrics::counter!("vigia_changes_detected_total")
                    .increment(summary.changes_detected as u64);
            }
            Err(failure) => {
                if failure.invalid_case {
                    if let Err(e) = self.store.mark_scan_invalid(job.case_file_id).await {
                        tracing::error!(
                            case_file_id = %job.case_file_id,
                            error = %e,
                            "Failed to mark case file scan-invalid"
                        );
                    }
                }

                if let Err(e) = self
                    .store
                    .record_scrape_error(job.case_file_id, failure.kind, &failure.message)
                    .await
                {
                    tracing::error!(
                        case_file_id = %job.case_file_id,
                        error = %e,
                        "Failed to record scrape error on snapshot"
                    );
                }

                let can_retry = failure.retryable && job.can_retry();
                reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error_kind: failure.kind,
                    error: &failure.message,
                    will_retry: can_retry,
                });

                if let Err(e) = self
                    .job_log
                    .record(NewJobLogEntry {
                        case_file_id: job.case_file_id,
                        tenant_id: job.tenant_id,
                        lane: job.lane,
                        status: if can_retry {
                            JobLogStatus::Retrying
                        } else {
                            JobLogStatus::Failed
                        },
                        attempt: job.attempt,
                        duration_ms: Some(duration_ms),
                        binnacles_found: None,
                        changes_detected: None,
                        error_kind: Some(failure.kind.to_string()),
                        error_message: Some(failure.message.clone()),
                        worker_id: Some(self.config.worker_id.clone()),
                        started_at,
                        completed_at: Some(completed_at),
                    })
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to write job log");
                }

                let retry_at = can_retry.then(|| self.config.retry.next_retry_at(job.attempt));
                if let Err(e) = self
                    .jobs
                    .fail(job.id, failure.kind, &failure.message, retry_at)
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
                }

                metrics::counter!(
                    "vigia_jobs_failed_total",
                    "lane" => job.lane.as_str(),
                    "kind" => failure.kind
                )
                .increment(1);
            }
        }
    }

    /// The scrape pipeline: case context → portal → validate → normalize →
    /// detect changes → download attachments → persist in one transaction.
    async fn execute(&self, job: &ScrapeJob) -> Result<JobSummary, AppError> {
        let ctx = self.store.case_context(job.case_file_id).await?;

        let mut session = self.portal.open().await?;

        let raws = self
            .portal
            .fetch_case(&mut session, &ctx.external_case_number, &ctx.party_name)
            .await?;

        let raws = normalize::validate(raws)?;
        let canonical = normalize::canonicalize(&raws);

        let prev = self.store.snapshot(job.case_file_id).await?;
        let now = Utc::now();

        let detection = diff::detect(
            prev.as_ref().map(|s| &s.canonical_payload),
            prev.as_ref().map(|s| s.content_hash.as_str()).unwrap_or(""),
            &canonical,
            now,
        )?;

        // Attachments download while the session still holds the portal's
        // detail view. A single failed file is a warning, never a job
        // failure.
        let mut attachments: Vec<NewFileAttachment> = Vec::new();
        for raw in &raws {
            let Some(url) = raw.file_url.as_deref() else {
                continue;
            };
            let original_name = file_name_from_url(url);
            if ctx
                .existing_attachments
                .get(&raw.index)
                .is_some_and(|names| names.contains(&original_name))
            {
                continue;
            }

            let local = match self.portal.download_file(&mut session, url).await {
                Ok(Some(path)) => path,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        binnacle_index = raw.index,
                        error = %e,
                        "Attachment download failed; continuing"
                    );
                    continue;
                }
            };

            let key = attachment_key(&self.attachment_prefix, ctx.tenant_id, &original_name);
            match self.objects.put_file(&local, &key).await {
                Ok(size) => attachments.push(NewFileAttachment {
                    binnacle_index: raw.index,
                    original_name,
                    size,
                    object_store_key: key,
                }),
                Err(e) => {
                    tracing::warn!(
                        binnacle_index = raw.index,
                        error = %e,
                        "Attachment upload failed; continuing"
                    );
                }
            }

            if let Err(e) = tokio::fs::remove_file(&local).await {
                tracing::warn!(path = %local.display(), error = %e, "Failed to remove temp file");
            }
        }

        drop(session);

        let mut changes: Vec<NewChangeLogEntry> = Vec::new();
        if detection.has_changes && !detection.is_first_scrape {
            changes.extend(detection.changes.iter().cloned());
            for attachment in &attachments {
                changes.push(NewChangeLogEntry {
                    change_type: ChangeType::NewFile,
                    field_name: None,
                    old_value: None,
                    new_value: Some(attachment.original_name.clone()),
                    detected_at: now,
                });
            }
        }

        let outcome = ScrapeOutcome {
            case_file_id: job.case_file_id,
            tenant_id: ctx.tenant_id,
            scraped_at: now,
            binnacles: raws.iter().map(normalize::to_new_binnacle).collect(),
            attachments,
            content_hash: detection.new_hash.clone(),
            canonical_payload: normalize::canonical_payload(&canonical)?,
            has_changes: detection.has_changes,
            is_first_scrape: detection.is_first_scrape,
            changes,
        };

        self.store.persist_scrape(&outcome).await?;

        Ok(JobSummary {
            binnacles_found: outcome.binnacles.len(),
            changes_detected: outcome.changes.len(),
        })
    }
}

/// Object-store key for one attachment:
/// `{prefix}/{tenant_id}/attachments/{uuid}.{ext}`.
fn attachment_key(prefix: &str, tenant_id: Uuid, original_name: &str) -> String {
    let ext = std::path::Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("pdf");
    format!(
        "{}/{}/attachments/{}.{}",
        prefix.trim_end_matches('/'),
        tenant_id,
        Uuid::new_v4(),
        ext
    )
}

/// Last path segment of a download URL, stripped of query parameters.
fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("document.pdf")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::job::{JobState, RetryPolicy};
    use crate::model::RawBinnacle;
    use crate::testutil::*;
    use std::time::Duration;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            worker_id: "test-worker".into(),
            poll_interval: Duration::from_millis(10),
            retry: RetryPolicy::default(),
        }
    }

    fn worker(
        jobs: MockJobStore,
        portal: MockPortal,
        store: MockScrapeStore,
    ) -> WorkerService<MockJobStore, MockPortal, MockScrapeStore, MockObjectStore, MockJobLog>
    {
        WorkerService::new(
            jobs,
            portal,
            store,
            MockObjectStore::new(),
            MockJobLog::new(),
            PortalBreaker::new(BreakerConfig::default()),
            LaneGate::with_defaults(4),
            test_config(),
            "cases",
        )
    }

    fn two_binnacles() -> Vec<RawBinnacle> {
        vec![make_raw_binnacle(1), make_raw_binnacle(2)]
    }

    #[tokio::test]
    async fn first_scrape_persists_snapshot_without_changes() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);
        let portal = MockPortal::with_binnacles(two_binnacles());
        let reporter = MockReporter::new();

        let svc = worker(jobs.clone(), portal, store.clone());
        svc.process_job(&job, &reporter).await;

        let outcomes = store.persisted.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(outcome.is_first_scrape);
        assert!(outcome.has_changes);
        assert_eq!(outcome.binnacles.len(), 2);
        assert!(outcome.changes.is_empty(), "first scrape emits no entries");

        assert_eq!(jobs.state_of(job.id), Some(JobState::Completed));
        let events = reporter.events.lock().unwrap();
        assert!(events.contains(&"JobCompleted".to_string()));
    }

    #[tokio::test]
    async fn unchanged_rescrape_emits_nothing() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);

        // Seed the snapshot with exactly what the portal will return.
        let canonical = normalize::canonicalize(&two_binnacles());
        store.seed_snapshot(job.case_file_id, &canonical);

        let portal = MockPortal::with_binnacles(two_binnacles());
        let reporter = MockReporter::new();

        let svc = worker(jobs, portal, store.clone());
        svc.process_job(&job, &reporter).await;

        let outcomes = store.persisted.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].is_first_scrape);
        assert!(!outcomes[0].has_changes);
        assert!(outcomes[0].changes.is_empty());
    }

    #[tokio::test]
    async fn modified_binnacle_emits_field_change() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);

        let canonical = normalize::canonicalize(&two_binnacles());
        store.seed_snapshot(job.case_file_id, &canonical);

        let mut changed = two_binnacles();
        changed[1].acto = Some("EMBARGO".into());
        let portal = MockPortal::with_binnacles(changed);
        let reporter = MockReporter::new();

        let svc = worker(jobs, portal, store.clone());
        svc.process_job(&job, &reporter).await;

        let outcomes = store.persisted.lock().unwrap();
        let changes = &outcomes[0].changes;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::ModifiedBinnacle);
        assert_eq!(changes[0].field_name.as_deref(), Some("acto"));
        assert_eq!(changes[0].old_value.as_deref(), Some("NOTIFICACION"));
        assert_eq!(changes[0].new_value.as_deref(), Some("EMBARGO"));
    }

    #[tokio::test]
    async fn invalid_case_number_marks_scan_invalid_and_fails() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);
        let portal = MockPortal::with_error(AppError::InvalidCaseNumber);
        let reporter = MockReporter::new();

        let svc = worker(jobs.clone(), portal, store.clone());
        svc.process_job(&job, &reporter).await;

        assert!(store
            .scan_invalidated
            .lock()
            .unwrap()
            .contains(&job.case_file_id));
        assert_eq!(jobs.state_of(job.id), Some(JobState::Failed));
        assert!(store.persisted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn captcha_failure_schedules_retry_with_backoff() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);
        let portal = MockPortal::with_error(AppError::CaptchaFailed("all strategies".into()));
        let reporter = MockReporter::new();

        let svc = worker(jobs.clone(), portal, store.clone());
        svc.process_job(&job, &reporter).await;

        let failures = jobs.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        let (_, kind, _, retry_at) = &failures[0];
        assert_eq!(kind, "captcha_failed");
        let retry_at = retry_at.expect("retryable failure should schedule retry");

        // 30s base, ±20% jitter.
        let delay = retry_at - Utc::now();
        assert!(delay >= chrono::Duration::seconds(23));
        assert!(delay <= chrono::Duration::seconds(37));

        // Error recorded on the snapshot.
        let errors = store.recorded_errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].1, "captcha_failed");
    }

    #[tokio::test]
    async fn transient_failure_then_success_logs_retrying_then_completed() {
        let mut job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);
        let portal = MockPortal::with_responses(vec![
            Err(AppError::CaptchaFailed("first attempt".into())),
            Ok(vec![make_raw_binnacle(1)]),
        ]);
        let reporter = MockReporter::new();

        let job_log = MockJobLog::new();
        let svc = WorkerService::new(
            jobs.clone(),
            portal,
            store.clone(),
            MockObjectStore::new(),
            job_log.clone(),
            PortalBreaker::new(BreakerConfig::default()),
            LaneGate::with_defaults(4),
            test_config(),
            "cases",
        );

        svc.process_job(&job, &reporter).await;
        job.attempt = 2;
        svc.process_job(&job, &reporter).await;

        let statuses: Vec<_> = job_log
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(
            statuses,
            [
                JobLogStatus::Started,
                JobLogStatus::Retrying,
                JobLogStatus::Started,
                JobLogStatus::Completed,
            ]
        );

        // Exactly one snapshot write, from the successful attempt.
        assert_eq!(store.persisted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_terminally() {
        let mut job = make_test_job();
        job.attempt = 3; // claimed for the third and final time
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);
        let portal = MockPortal::with_error(AppError::Timeout(30));
        let reporter = MockReporter::new();

        let svc = worker(jobs.clone(), portal, store);
        svc.process_job(&job, &reporter).await;

        let failures = jobs.failures.lock().unwrap();
        assert!(failures[0].3.is_none(), "no retry after max attempts");
    }

    #[tokio::test]
    async fn panic_in_job_is_classified_unknown() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);
        let portal = MockPortal::panicking();
        let reporter = MockReporter::new();

        let svc = worker(jobs.clone(), portal, store);
        svc.process_job(&job, &reporter).await;

        let failures = jobs.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].1, "unknown");
        assert!(failures[0].3.is_some(), "unknown errors retry");
    }

    #[tokio::test]
    async fn job_log_records_started_then_completed() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);
        let portal = MockPortal::with_binnacles(two_binnacles());
        let reporter = MockReporter::new();

        let job_log = MockJobLog::new();
        let svc = WorkerService::new(
            jobs,
            portal,
            store,
            MockObjectStore::new(),
            job_log.clone(),
            PortalBreaker::new(BreakerConfig::default()),
            LaneGate::with_defaults(4),
            test_config(),
            "cases",
        );
        svc.process_job(&job, &reporter).await;

        let entries = job_log.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, JobLogStatus::Started);
        assert_eq!(entries[1].status, JobLogStatus::Completed);
        assert_eq!(entries[1].binnacles_found, Some(2));
        assert_eq!(entries[1].changes_detected, Some(0));
        assert!(entries[1].duration_ms.is_some());
    }

    #[tokio::test]
    async fn new_attachment_is_uploaded_and_recorded() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);

        let mut binnacle = make_raw_binnacle(1);
        binnacle.file_url = Some("https://portal.example/docs/resolucion.pdf".into());
        let portal = MockPortal::with_binnacles(vec![binnacle]);
        let objects = MockObjectStore::new();
        let reporter = MockReporter::new();

        let svc = WorkerService::new(
            jobs,
            portal,
            store.clone(),
            objects.clone(),
            MockJobLog::new(),
            PortalBreaker::new(BreakerConfig::default()),
            LaneGate::with_defaults(4),
            test_config(),
            "cases",
        );
        svc.process_job(&job, &reporter).await;

        let keys = objects.stored_keys.lock().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with(&format!("cases/{}/attachments/", job.tenant_id)));
        assert!(keys[0].ends_with(".pdf"));

        let outcomes = store.persisted.lock().unwrap();
        assert_eq!(outcomes[0].attachments.len(), 1);
        assert_eq!(outcomes[0].attachments[0].original_name, "resolucion.pdf");
    }

    #[tokio::test]
    async fn existing_attachment_is_not_redownloaded() {
        let job = make_test_job();
        let jobs = MockJobStore::with_job(job.clone());
        let store = MockScrapeStore::for_case(job.case_file_id, job.tenant_id);
        store.seed_attachment(1, "resolucion.pdf");

        let mut binnacle = make_raw_binnacle(1);
        binnacle.file_url = Some("https://portal.example/docs/resolucion.pdf".into());
        let portal = MockPortal::with_binnacles(vec![binnacle]);
        let objects = MockObjectStore::new();
        let reporter = MockReporter::new();

        let svc = WorkerService::new(
            jobs,
            portal,
            store.clone(),
            objects.clone(),
            MockJobLog::new(),
            PortalBreaker::new(BreakerConfig::default()),
            LaneGate::with_defaults(4),
            test_config(),
            "cases",
        );
        svc.process_job(&job, &reporter).await;

        assert!(objects.stored_keys.lock().unwrap().is_empty());
        assert!(store.persisted.lock().unwrap()[0].attachments.is_empty());
    }

    #[tokio::test]
    async fn run_loop_graceful_shutdown_releases_jobs() {
        let jobs = MockJobStore::empty();
        let store = MockScrapeStore::for_case(Uuid::new_v4(), Uuid::new_v4());
        let portal = MockPortal::with_binnacles(vec![]);
        let reporter = MockReporter::new();
        let cancel = CancellationToken::new();

        let svc = worker(jobs.clone(), portal, store);
        cancel.cancel();
        svc.run(cancel, &reporter).await.unwrap();

        let released = jobs.released_workers.lock().unwrap();
        assert_eq!(released.as_slice(), ["test-worker"]);

        let events = reporter.events.lock().unwrap();
        assert!(events.contains(&"Started".to_string()));
        assert!(events.contains(&"Stopped".to_string()));
    }

    #[test]
    fn lane_gate_defaults() {
        let gate = LaneGate::with_defaults(6);
        assert_eq!(gate.caps[&Lane::Monitor], 6);
        assert_eq!(gate.caps[&Lane::Initial], 3);
        assert_eq!(gate.caps[&Lane::Priority], 2);

        let tiny = LaneGate::with_defaults(1);
        assert_eq!(tiny.caps[&Lane::Priority], 1);
    }

    #[test]
    fn lane_gate_excludes_full_lanes() {
        let gate = LaneGate::new(HashMap::from([
            (Lane::Priority, 1),
            (Lane::Initial, 1),
            (Lane::Monitor, 1),
        ]));

        let slot = gate.begin(Lane::Priority);
        assert_eq!(gate.open_lanes(), vec![Lane::Initial, Lane::Monitor]);

        drop(slot);
        assert_eq!(
            gate.open_lanes(),
            vec![Lane::Priority, Lane::Initial, Lane::Monitor]
        );
    }

    #[test]
    fn attachment_key_shape() {
        let tenant = Uuid::nil();
        let key = attachment_key("cases/", tenant, "oficio.docx");
        assert!(key.starts_with("cases/00000000-0000-0000-0000-000000000000/attachments/"));
        assert!(key.ends_with(".docx"));
    }

    #[test]
    fn file_name_from_url_strips_query() {
        assert_eq!(
            file_name_from_url("https://x.example/a/b/archivo.pdf?dl=1"),
            "archivo.pdf"
        );
        assert_eq!(file_name_from_url("https://x.example/"), "document.pdf");
    }
}
