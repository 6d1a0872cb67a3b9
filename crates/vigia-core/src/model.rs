use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::Lane;

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// A tenant-bank subscription. Case files, schedules and notifications all
/// scope to one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub scrape_enabled: bool,
}

/// Wall-clock delivery times for one tenant. Only schedules with
/// `logic_key == "portal-monitoring"` drive scraping.
#[derive(Debug, Clone)]
pub struct TenantSchedule {
    pub tenant_id: Uuid,
    pub hours: Vec<NaiveTime>,
}

/// The logic key that marks a schedule as a scrape driver.
pub const PORTAL_MONITORING_LOGIC_KEY: &str = "portal-monitoring";

// ---------------------------------------------------------------------------
// Case files
// ---------------------------------------------------------------------------

/// The judicial case being monitored, identified by its external number.
#[derive(Debug, Clone, Serialize)]
pub struct CaseFile {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_case_number: String,
    pub party_name: String,
    pub scrape_enabled: bool,
    pub scan_valid: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub has_pending_changes: bool,
    pub was_scanned: bool,
}

/// Scheduler view of a case file: just what the adaptive rule needs.
#[derive(Debug, Clone)]
pub struct CaseFileSummary {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_case_number: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Binnacles
// ---------------------------------------------------------------------------

/// A binnacle is either a resolution (carries a resolution date) or a
/// procedural writ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BinnacleKind {
    Resolution,
    Writ,
}

impl BinnacleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinnacleKind::Resolution => "RESOLUTION",
            BinnacleKind::Writ => "WRIT",
        }
    }
}

impl fmt::Display for BinnacleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BinnacleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESOLUTION" => Ok(BinnacleKind::Resolution),
            "WRIT" => Ok(BinnacleKind::Writ),
            _ => Err(format!("Unknown binnacle kind: {s}")),
        }
    }
}

/// One timeline entry exactly as extracted from the portal, before
/// normalization. All fields are raw strings; the normalizer owns parsing.
#[derive(Debug, Clone, Default)]
pub struct RawBinnacle {
    /// 1-based position on the portal timeline.
    pub index: u32,
    pub resolution_date: Option<String>,
    pub entry_date: Option<String>,
    pub resolution: Option<String>,
    pub notification_type: Option<String>,
    pub acto: Option<String>,
    pub fojas: Option<String>,
    pub folios: Option<String>,
    pub provedio_date: Option<String>,
    pub sumilla: Option<String>,
    pub user_description: Option<String>,
    pub notifications: Vec<RawNotification>,
    pub file_url: Option<String>,
}

/// One notification row under a binnacle, as extracted.
#[derive(Debug, Clone, Default)]
pub struct RawNotification {
    pub code: String,
    pub addressee: Option<String>,
    pub ship_date: Option<String>,
    pub attachments: Option<String>,
    pub delivery_method: Option<String>,
    pub issued_at: Option<String>,
    pub dispatched_at: Option<String>,
    pub delivered_at: Option<String>,
    pub returned_at: Option<String>,
    pub received_at: Option<String>,
    pub acknowledged_at: Option<String>,
}

/// Normalized binnacle row ready for persistence.
#[derive(Debug, Clone)]
pub struct NewBinnacle {
    pub index: u32,
    pub kind: BinnacleKind,
    pub resolution_date: Option<NaiveDateTime>,
    pub entry_date: Option<NaiveDateTime>,
    pub resolution: Option<String>,
    pub notification_type: Option<String>,
    pub acto: Option<String>,
    pub fojas: Option<i64>,
    pub folios: Option<i64>,
    pub provedio_date: Option<NaiveDateTime>,
    pub sumilla: Option<String>,
    pub user_description: Option<String>,
    pub notifications: Vec<NewNotification>,
}

/// Normalized notification row ready for persistence.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub code: String,
    pub addressee: Option<String>,
    pub ship_date: Option<NaiveDateTime>,
    pub attachments: Option<String>,
    pub delivery_method: Option<String>,
    pub issued_at: Option<NaiveDateTime>,
    pub dispatched_at: Option<NaiveDateTime>,
    pub delivered_at: Option<NaiveDateTime>,
    pub returned_at: Option<NaiveDateTime>,
    pub received_at: Option<NaiveDateTime>,
    pub acknowledged_at: Option<NaiveDateTime>,
}

/// Downloaded attachment staged for persistence. `binnacle_index` resolves
/// to the binnacle row inside the scrape transaction.
#[derive(Debug, Clone)]
pub struct NewFileAttachment {
    pub binnacle_index: u32,
    pub original_name: String,
    pub size: i64,
    pub object_store_key: String,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Canonical representation of a case file's timeline at its most recent
/// successful scrape. Exactly one row per case file; always upserted.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub case_file_id: Uuid,
    /// SHA-256 of the canonical payload, 64-char lowercase hex.
    pub content_hash: String,
    pub binnacle_count: i32,
    pub canonical_payload: serde_json::Value,
    pub last_scraped_at: DateTime<Utc>,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub scrape_count: i32,
    pub consecutive_no_change: i32,
    pub error_count: i32,
    pub last_error: Option<String>,
}

/// Scheduler view of a snapshot: just the two timestamps the adaptive
/// frequency rule reads.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotSummary {
    pub last_scraped_at: DateTime<Utc>,
    pub last_changed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Change log
// ---------------------------------------------------------------------------

/// Category of a detected change between two consecutive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    NewBinnacle,
    ModifiedBinnacle,
    RemovedBinnacle,
    NewNotification,
    NewFile,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::NewBinnacle => "NEW_BINNACLE",
            ChangeType::ModifiedBinnacle => "MODIFIED_BINNACLE",
            ChangeType::RemovedBinnacle => "REMOVED_BINNACLE",
            ChangeType::NewNotification => "NEW_NOTIFICATION",
            ChangeType::NewFile => "NEW_FILE",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW_BINNACLE" => Ok(ChangeType::NewBinnacle),
            "MODIFIED_BINNACLE" => Ok(ChangeType::ModifiedBinnacle),
            "REMOVED_BINNACLE" => Ok(ChangeType::RemovedBinnacle),
            "NEW_NOTIFICATION" => Ok(ChangeType::NewNotification),
            "NEW_FILE" => Ok(ChangeType::NewFile),
            _ => Err(format!("Unknown change type: {s}")),
        }
    }
}

/// One append-only change record. The `notified` flag is flipped by the
/// downstream dispatcher, never by this service.
#[derive(Debug, Clone, Serialize)]
pub struct NewChangeLogEntry {
    pub change_type: ChangeType,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Job log
// ---------------------------------------------------------------------------

/// Outcome of one job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobLogStatus {
    Started,
    Completed,
    Failed,
    Retrying,
}

impl JobLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobLogStatus::Started => "started",
            JobLogStatus::Completed => "completed",
            JobLogStatus::Failed => "failed",
            JobLogStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for JobLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One job-log row: a single attempt of a single job.
#[derive(Debug, Clone)]
pub struct NewJobLogEntry {
    pub case_file_id: Uuid,
    pub tenant_id: Uuid,
    pub lane: Lane,
    pub status: JobLogStatus,
    pub attempt: u32,
    pub duration_ms: Option<i64>,
    pub binnacles_found: Option<i32>,
    pub changes_detected: Option<i32>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Worker exchange types
// ---------------------------------------------------------------------------

/// Everything the worker needs to know about a case file before it touches
/// the portal, loaded in one repository round trip.
#[derive(Debug, Clone)]
pub struct CaseContext {
    pub case_file_id: Uuid,
    pub tenant_id: Uuid,
    pub external_case_number: String,
    pub party_name: String,
    /// Attachment names already stored, keyed by binnacle index. Used to
    /// skip re-downloading blobs the store already holds.
    pub existing_attachments: HashMap<u32, HashSet<String>>,
}

/// The full result of one successful scrape, persisted as a single unit of
/// work by the repository.
#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub case_file_id: Uuid,
    pub tenant_id: Uuid,
    pub scraped_at: DateTime<Utc>,
    pub binnacles: Vec<NewBinnacle>,
    pub attachments: Vec<NewFileAttachment>,
    pub content_hash: String,
    pub canonical_payload: serde_json::Value,
    pub has_changes: bool,
    pub is_first_scrape: bool,
    pub changes: Vec<NewChangeLogEntry>,
}
