//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability, allowing test assertions on
//! recorded calls.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{EnqueueRequest, JobState, Lane, Priority, ScrapeJob};
use crate::job_store::{JobStore, LaneCounts};
use crate::model::{
    CaseContext, CaseFileSummary, NewJobLogEntry, RawBinnacle, ScrapeOutcome, Snapshot,
    SnapshotSummary, TenantSchedule,
};
use crate::normalize::{canonical_payload, hash_binnacles, CanonicalBinnacle};
use crate::traits::{JobLog, ObjectStore, PlanStore, Portal, ScrapeStore};

// ---------------------------------------------------------------------------
// MockJobStore
// ---------------------------------------------------------------------------

/// Recorded failure: (job_id, error_kind, error_message, retry_at).
pub type FailureRecord = (Uuid, String, String, Option<DateTime<Utc>>);

/// In-memory job store with real dedup and claim-ordering semantics.
#[derive(Clone)]
pub struct MockJobStore {
    jobs: Arc<Mutex<Vec<ScrapeJob>>>,
    pub failures: Arc<Mutex<Vec<FailureRecord>>>,
    pub released_workers: Arc<Mutex<Vec<String>>>,
}

impl MockJobStore {
    pub fn empty() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(Vec::new())),
            released_workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_job(job: ScrapeJob) -> Self {
        let store = Self::empty();
        store.jobs.lock().unwrap().push(job);
        store
    }

    pub fn state_of(&self, job_id: Uuid) -> Option<JobState> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .map(|j| j.state)
    }

    pub fn job(&self, job_id: Uuid) -> Option<ScrapeJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }
}

impl JobStore for MockJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs
            .iter()
            .find(|j| j.dedup_key == request.dedup_key && !j.state.is_terminal())
        {
            return Ok(existing.id);
        }

        let job = ScrapeJob {
            id: Uuid::new_v4(),
            lane: request.lane,
            case_file_id: request.case_file_id,
            tenant_id: request.tenant_id,
            case_number: request.case_number,
            priority: request.priority,
            dedup_key: request.dedup_key,
            attempt: 0,
            max_attempts: 3,
            state: JobState::Pending,
            deadline: request.deadline,
            next_run_at: None,
            last_error: None,
            enqueued_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
        };
        let id = job.id;
        jobs.push(job);
        Ok(id)
    }

    async fn next_ready(
        &self,
        worker_id: &str,
        lanes: &[Lane],
    ) -> Result<Option<ScrapeJob>, AppError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();

        let mut best: Option<usize> = None;
        for (i, job) in jobs.iter().enumerate() {
            let ready = match job.state {
                JobState::Pending => true,
                JobState::Delayed => job.next_run_at.is_some_and(|t| t <= now),
                _ => false,
            };
            if !ready || !lanes.contains(&job.lane) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let current = &jobs[b];
                    (job.lane.poll_rank(), job.priority.as_i16(), job.enqueued_at)
                        < (
                            current.lane.poll_rank(),
                            current.priority.as_i16(),
                            current.enqueued_at,
                        )
                }
            };
            if better {
                best = Some(i);
            }
        }

        Ok(best.map(|i| {
            let job = &mut jobs[i];
            job.state = JobState::Active;
            job.attempt += 1;
            job.worker_id = Some(worker_id.to_string());
            job.started_at = Some(now);
            job.clone()
        }))
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.state = JobState::Completed;
            job.completed_at = Some(Utc::now());
            job.worker_id = None;
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error_kind: &str,
        error_message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.failures.lock().unwrap().push((
            job_id,
            error_kind.to_string(),
            error_message.to_string(),
            retry_at,
        ));

        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            match retry_at {
                Some(at) => {
                    job.state = JobState::Delayed;
                    job.next_run_at = Some(at);
                }
                None => job.state = JobState::Failed,
            }
            job.last_error = Some(format!("{error_kind}: {error_message}"));
            job.worker_id = None;
        }
        Ok(())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        self.released_workers
            .lock()
            .unwrap()
            .push(worker_id.to_string());

        let mut jobs = self.jobs.lock().unwrap();
        let mut count = 0u64;
        for job in jobs.iter_mut() {
            if job.worker_id.as_deref() == Some(worker_id) && job.state == JobState::Active {
                job.state = JobState::Pending;
                job.worker_id = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count(&self, lane: Lane, state: JobState) -> Result<i64, AppError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .iter()
            .filter(|j| j.lane == lane && j.state == state)
            .count() as i64)
    }

    async fn lane_counts(&self) -> Result<HashMap<Lane, LaneCounts>, AppError> {
        let jobs = self.jobs.lock().unwrap();
        let mut counts: HashMap<Lane, LaneCounts> = HashMap::new();
        for job in jobs.iter() {
            let entry = counts.entry(job.lane).or_default();
            match job.state {
                JobState::Pending => entry.pending += 1,
                JobState::Active => entry.active += 1,
                JobState::Delayed => entry.delayed += 1,
                JobState::Completed => entry.completed += 1,
                JobState::Failed => entry.failed += 1,
            }
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// MockPortal
// ---------------------------------------------------------------------------

enum PortalBehavior {
    Respond(Vec<Result<Vec<RawBinnacle>, AppError>>),
    Panic,
}

/// Mock portal returning queued responses; sessions are unit.
#[derive(Clone)]
pub struct MockPortal {
    behavior: Arc<Mutex<PortalBehavior>>,
    pub downloads: Arc<Mutex<Vec<String>>>,
}

impl MockPortal {
    pub fn with_binnacles(binnacles: Vec<RawBinnacle>) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(PortalBehavior::Respond(vec![Ok(binnacles)]))),
            downloads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(PortalBehavior::Respond(vec![Err(error)]))),
            downloads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Each call pops the next response; an exhausted queue returns an
    /// empty timeline.
    pub fn with_responses(responses: Vec<Result<Vec<RawBinnacle>, AppError>>) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(PortalBehavior::Respond(responses))),
            downloads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn panicking() -> Self {
        Self {
            behavior: Arc::new(Mutex::new(PortalBehavior::Panic)),
            downloads: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Portal for MockPortal {
    type Session = ();

    async fn open(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn fetch_case(
        &self,
        _session: &mut (),
        _case_number: &str,
        _party_name: &str,
    ) -> Result<Vec<RawBinnacle>, AppError> {
        let mut behavior = self.behavior.lock().unwrap();
        match &mut *behavior {
            PortalBehavior::Panic => panic!("portal exploded"),
            PortalBehavior::Respond(queue) => {
                if queue.is_empty() {
                    Ok(vec![])
                } else {
                    queue.remove(0)
                }
            }
        }
    }

    async fn download_file(
        &self,
        _session: &mut (),
        url: &str,
    ) -> Result<Option<PathBuf>, AppError> {
        self.downloads.lock().unwrap().push(url.to_string());
        let path = std::env::temp_dir().join(format!("vigia-test-{}", Uuid::new_v4()));
        std::fs::write(&path, b"mock attachment")
            .map_err(|e| AppError::Unknown(e.to_string()))?;
        Ok(Some(path))
    }
}

// ---------------------------------------------------------------------------
// MockScrapeStore
// ---------------------------------------------------------------------------

/// Recorded snapshot error: (case_file_id, error_kind, error_message).
pub type RecordedError = (Uuid, String, String);

#[derive(Clone)]
pub struct MockScrapeStore {
    context: Arc<Mutex<CaseContext>>,
    snapshot: Arc<Mutex<Option<Snapshot>>>,
    pub persisted: Arc<Mutex<Vec<ScrapeOutcome>>>,
    pub scan_invalidated: Arc<Mutex<Vec<Uuid>>>,
    pub recorded_errors: Arc<Mutex<Vec<RecordedError>>>,
    persist_error: Arc<Mutex<Option<AppError>>>,
}

impl MockScrapeStore {
    pub fn for_case(case_file_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            context: Arc::new(Mutex::new(CaseContext {
                case_file_id,
                tenant_id,
                external_case_number: "00123-2025-0-1801-JR-CI-01".into(),
                party_name: "BANCO DEL SUR".into(),
                existing_attachments: HashMap::new(),
            })),
            snapshot: Arc::new(Mutex::new(None)),
            persisted: Arc::new(Mutex::new(Vec::new())),
            scan_invalidated: Arc::new(Mutex::new(Vec::new())),
            recorded_errors: Arc::new(Mutex::new(Vec::new())),
            persist_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_persist_error(self, error: AppError) -> Self {
        *self.persist_error.lock().unwrap() = Some(error);
        self
    }

    /// Seed the stored snapshot from a canonical list, as if a prior scrape
    /// had persisted it.
    pub fn seed_snapshot(&self, case_file_id: Uuid, canonical: &[CanonicalBinnacle]) {
        let snapshot = Snapshot {
            case_file_id,
            content_hash: hash_binnacles(canonical).expect("hashable"),
            binnacle_count: canonical.len() as i32,
            canonical_payload: canonical_payload(canonical).expect("serializable"),
            last_scraped_at: Utc::now(),
            last_changed_at: None,
            scrape_count: 1,
            consecutive_no_change: 0,
            error_count: 0,
            last_error: None,
        };
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    pub fn seed_attachment(&self, binnacle_index: u32, name: &str) {
        self.context
            .lock()
            .unwrap()
            .existing_attachments
            .entry(binnacle_index)
            .or_insert_with(HashSet::new)
            .insert(name.to_string());
    }
}

impl ScrapeStore for MockScrapeStore {
    async fn case_context(&self, _case_file_id: Uuid) -> Result<CaseContext, AppError> {
        Ok(self.context.lock().unwrap().clone())
    }

    async fn snapshot(&self, _case_file_id: Uuid) -> Result<Option<Snapshot>, AppError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn persist_scrape(&self, outcome: &ScrapeOutcome) -> Result<(), AppError> {
        let mut err = self.persist_error.lock().unwrap();
        if let Some(e) = err.take() {
            return Err(e);
        }
        self.persisted.lock().unwrap().push(outcome.clone());
        Ok(())
    }

    async fn mark_scan_invalid(&self, case_file_id: Uuid) -> Result<(), AppError> {
        self.scan_invalidated.lock().unwrap().push(case_file_id);
        Ok(())
    }

    async fn record_scrape_error(
        &self,
        case_file_id: Uuid,
        error_kind: &str,
        error_message: &str,
    ) -> Result<(), AppError> {
        self.recorded_errors.lock().unwrap().push((
            case_file_id,
            error_kind.to_string(),
            error_message.to_string(),
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockObjectStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockObjectStore {
    pub stored_keys: Arc<Mutex<Vec<String>>>,
    put_error: Arc<Mutex<Option<AppError>>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self {
            stored_keys: Arc::new(Mutex::new(Vec::new())),
            put_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_put_error(error: AppError) -> Self {
        Self {
            stored_keys: Arc::new(Mutex::new(Vec::new())),
            put_error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl Default for MockObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MockObjectStore {
    async fn put_file(&self, _local: &Path, key: &str) -> Result<i64, AppError> {
        let mut err = self.put_error.lock().unwrap();
        if let Some(e) = err.take() {
            return Err(e);
        }
        self.stored_keys.lock().unwrap().push(key.to_string());
        Ok(1024)
    }
}

// ---------------------------------------------------------------------------
// MockJobLog
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockJobLog {
    pub entries: Arc<Mutex<Vec<NewJobLogEntry>>>,
}

impl MockJobLog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for MockJobLog {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLog for MockJobLog {
    async fn record(&self, entry: NewJobLogEntry) -> Result<(), AppError> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockPlanStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockPlanStore {
    schedules: Arc<Mutex<Vec<TenantSchedule>>>,
    case_files: Arc<Mutex<Vec<CaseFileSummary>>>,
    snapshots: Arc<Mutex<HashMap<Uuid, SnapshotSummary>>>,
}

impl MockPlanStore {
    pub fn new() -> Self {
        Self {
            schedules: Arc::new(Mutex::new(Vec::new())),
            case_files: Arc::new(Mutex::new(Vec::new())),
            snapshots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_schedule(&self, tenant_id: Uuid, hours: Vec<NaiveTime>) {
        self.schedules
            .lock()
            .unwrap()
            .push(TenantSchedule { tenant_id, hours });
    }

    pub fn add_case_file(
        &self,
        tenant_id: Uuid,
        case_number: &str,
        created_at: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.case_files.lock().unwrap().push(CaseFileSummary {
            id,
            tenant_id,
            external_case_number: case_number.to_string(),
            created_at,
        });
        id
    }

    pub fn add_snapshot(
        &self,
        case_file_id: Uuid,
        last_scraped_at: DateTime<Utc>,
        last_changed_at: Option<DateTime<Utc>>,
    ) {
        self.snapshots.lock().unwrap().insert(
            case_file_id,
            SnapshotSummary {
                last_scraped_at,
                last_changed_at,
            },
        );
    }
}

impl Default for MockPlanStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanStore for MockPlanStore {
    async fn monitoring_schedules(&self) -> Result<Vec<TenantSchedule>, AppError> {
        Ok(self.schedules.lock().unwrap().clone())
    }

    async fn eligible_case_files(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<CaseFileSummary>, AppError> {
        Ok(self
            .case_files
            .lock()
            .unwrap()
            .iter()
            .filter(|cf| cf.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn snapshots_for(
        &self,
        case_file_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, SnapshotSummary>, AppError> {
        let snapshots = self.snapshots.lock().unwrap();
        Ok(case_file_ids
            .iter()
            .filter_map(|id| snapshots.get(id).map(|s| (*id, *s)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl crate::worker::WorkerReporter for MockReporter {
    fn report(&self, event: crate::worker::WorkerEvent<'_>) {
        let label = match &event {
            crate::worker::WorkerEvent::Started { .. } => "Started",
            crate::worker::WorkerEvent::Polling => "Polling",
            crate::worker::WorkerEvent::JobClaimed { .. } => "JobClaimed",
            crate::worker::WorkerEvent::JobCompleted { .. } => "JobCompleted",
            crate::worker::WorkerEvent::JobFailed { .. } => "JobFailed",
            crate::worker::WorkerEvent::ShuttingDown { .. } => "ShuttingDown",
            crate::worker::WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Create a claimed scrape job (attempt 1 of 3) for testing.
pub fn make_test_job() -> ScrapeJob {
    let case_file_id = Uuid::new_v4();
    ScrapeJob {
        id: Uuid::new_v4(),
        lane: Lane::Monitor,
        case_file_id,
        tenant_id: Uuid::new_v4(),
        case_number: "00123-2025-0-1801-JR-CI-01".to_string(),
        priority: Priority::Medium,
        dedup_key: format!("monitor:{case_file_id}:20250315"),
        attempt: 1,
        max_attempts: 3,
        state: JobState::Active,
        deadline: None,
        next_run_at: None,
        last_error: None,
        enqueued_at: Utc::now(),
        updated_at: Utc::now(),
        started_at: Some(Utc::now()),
        completed_at: None,
        worker_id: Some("test-worker".to_string()),
    }
}

/// A raw binnacle with a distinct identity per index.
pub fn make_raw_binnacle(index: u32) -> RawBinnacle {
    RawBinnacle {
        index,
        resolution_date: Some("15/03/2025".into()),
        entry_date: Some("16/03/2025 10:30".into()),
        resolution: Some(format!("RES-{index}")),
        notification_type: None,
        acto: Some("NOTIFICACION".into()),
        fojas: Some("12".into()),
        folios: None,
        provedio_date: None,
        sumilla: Some("Se resuelve tener por apersonado".into()),
        user_description: None,
        notifications: Vec::new(),
        file_url: None,
    }
}
