use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::jitter_factor;

/// Logical lane of the job queue. Poll policy: PRIORITY > INITIAL > MONITOR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Initial,
    Monitor,
    Priority,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Priority, Lane::Initial, Lane::Monitor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Initial => "initial",
            Lane::Monitor => "monitor",
            Lane::Priority => "priority",
        }
    }

    /// Claim order across lanes when all have ready work (0 claims first).
    pub fn poll_rank(&self) -> i16 {
        match self {
            Lane::Priority => 0,
            Lane::Initial => 1,
            Lane::Monitor => 2,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initial" => Ok(Lane::Initial),
            "monitor" => Ok(Lane::Monitor),
            "priority" => Ok(Lane::Priority),
            _ => Err(format!("Unknown lane: {s}")),
        }
    }
}

/// Priority classes within a lane; lower numbers claim first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_i16(&self) -> i16 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 5,
        }
    }

    pub fn from_i16(v: i16) -> Priority {
        match v {
            1 => Priority::Critical,
            2 => Priority::High,
            3 => Priority::Medium,
            _ => Priority::Low,
        }
    }
}

/// State of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Unknown job state: {s}")),
        }
    }
}

/// A scrape job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub lane: Lane,
    pub case_file_id: Uuid,
    pub tenant_id: Uuid,
    pub case_number: String,
    pub priority: Priority,
    pub dedup_key: String,
    /// Number of times this job has been claimed (1-based once running).
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub deadline: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

impl ScrapeJob {
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Request to enqueue a job. Built through the per-lane constructors so the
/// dedup key always matches the lane's convention.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub lane: Lane,
    pub case_file_id: Uuid,
    pub tenant_id: Uuid,
    pub case_number: String,
    pub priority: Priority,
    pub dedup_key: String,
    pub deadline: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    /// Scheduler-driven monitor job, deduplicated per calendar day in the
    /// configured timezone.
    pub fn monitor(
        case_file_id: Uuid,
        tenant_id: Uuid,
        case_number: impl Into<String>,
        priority: Priority,
        day: NaiveDate,
    ) -> Self {
        Self {
            lane: Lane::Monitor,
            case_file_id,
            tenant_id,
            case_number: case_number.into(),
            priority,
            dedup_key: monitor_dedup_key(case_file_id, day),
            deadline: None,
        }
    }

    /// First scrape of a newly registered case file. Always critical.
    pub fn initial(
        case_file_id: Uuid,
        tenant_id: Uuid,
        case_number: impl Into<String>,
        day: NaiveDate,
    ) -> Self {
        Self {
            lane: Lane::Initial,
            case_file_id,
            tenant_id,
            case_number: case_number.into(),
            priority: Priority::Critical,
            dedup_key: initial_dedup_key(case_file_id, day),
            deadline: None,
        }
    }

    /// Operator-requested immediate scrape. Each request is a new job: the
    /// dedup key embeds the request's timestamp and never collides.
    pub fn priority(
        case_file_id: Uuid,
        tenant_id: Uuid,
        case_number: impl Into<String>,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lane: Lane::Priority,
            case_file_id,
            tenant_id,
            case_number: case_number.into(),
            priority: Priority::Critical,
            dedup_key: priority_dedup_key(case_file_id, requested_at),
            deadline: None,
        }
    }
}

pub fn monitor_dedup_key(case_file_id: Uuid, day: NaiveDate) -> String {
    format!("monitor:{case_file_id}:{}", day.format("%Y%m%d"))
}

pub fn initial_dedup_key(case_file_id: Uuid, day: NaiveDate) -> String {
    format!("initial:{case_file_id}:{}", day.format("%Y%m%d"))
}

pub fn priority_dedup_key(case_file_id: Uuid, requested_at: DateTime<Utc>) -> String {
    format!("priority:{case_file_id}:{}", requested_at.timestamp_millis())
}

/// Retry configuration: exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Multiplicative jitter spread (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the attempt that just failed
    /// (1-indexed): `base * 2^(attempt-1) * (1 ± jitter)`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.backoff_base.as_secs_f64() * f64::from(1u32 << exp);
        Duration::from_secs_f64(base * jitter_factor(self.jitter))
    }

    pub fn next_retry_at(&self, attempt: u32) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.delay_after_attempt(attempt))
                .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }
}

/// Configuration for one worker task.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
