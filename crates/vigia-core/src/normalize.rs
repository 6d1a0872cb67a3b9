//! Normalization of raw portal extractions into canonical binnacle records,
//! plus the content hash over a canonical list.
//!
//! Rules applied before both hashing and persistence:
//! - strings are trimmed; empty or whitespace-only become `None`
//! - numeric fields parse as base-10 integers; parse failure becomes `None`
//! - dates parse from the portal's `DD/MM/YYYY[ HH:MM[:SS]]` format;
//!   unparseable input or the literal `"-"` becomes `None`

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::model::{BinnacleKind, NewBinnacle, NewNotification, RawBinnacle, RawNotification};

/// Canonical form of one binnacle, the unit of hashing and diffing.
///
/// Dates are ISO-8601 strings so the canonical payload is self-describing
/// when stored. `notification_count` participates in the hash so that added
/// notifications change the hash even when every binnacle field matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalBinnacle {
    pub index: u32,
    pub resolution_date: Option<String>,
    pub entry_date: Option<String>,
    pub resolution: Option<String>,
    pub notification_type: Option<String>,
    pub acto: Option<String>,
    pub fojas: Option<i64>,
    pub folios: Option<i64>,
    pub provedio_date: Option<String>,
    pub sumilla: Option<String>,
    pub user_description: Option<String>,
    pub notification_count: usize,
}

/// Trim a raw string field; empty or whitespace-only collapses to `None`.
pub fn clean_str(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse a base-10 integer field. Anything unparseable collapses to `None`.
pub fn parse_int(raw: Option<&str>) -> Option<i64> {
    clean_str(raw)?.parse().ok()
}

const DATE_FORMATS: &[&str] = &["%d/%m/%Y %H:%M:%S", "%d/%m/%Y %H:%M", "%d/%m/%Y"];

/// Parse a portal date. The portal writes `DD/MM/YYYY` with an optional
/// `HH:MM[:SS]` suffix and uses a bare `-` for missing values.
pub fn parse_portal_date(raw: Option<&str>) -> Option<NaiveDateTime> {
    let s = clean_str(raw)?;
    if s == "-" {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Some(dt);
        }
        // Date-only input has no time component to parse.
        if let Ok(d) = chrono::NaiveDate::parse_from_str(&s, fmt) {
            return Some(d.and_time(chrono::NaiveTime::MIN));
        }
    }
    None
}

fn iso8601(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Normalize one raw binnacle into its canonical form.
pub fn canonical(raw: &RawBinnacle) -> CanonicalBinnacle {
    CanonicalBinnacle {
        index: raw.index,
        resolution_date: parse_portal_date(raw.resolution_date.as_deref()).map(iso8601),
        entry_date: parse_portal_date(raw.entry_date.as_deref()).map(iso8601),
        resolution: clean_str(raw.resolution.as_deref()),
        notification_type: clean_str(raw.notification_type.as_deref()),
        acto: clean_str(raw.acto.as_deref()),
        fojas: parse_int(raw.fojas.as_deref()),
        folios: parse_int(raw.folios.as_deref()),
        provedio_date: parse_portal_date(raw.provedio_date.as_deref()).map(iso8601),
        sumilla: clean_str(raw.sumilla.as_deref()),
        user_description: clean_str(raw.user_description.as_deref()),
        notification_count: raw.notifications.len(),
    }
}

/// Normalize a full extraction, sorted by index ascending.
pub fn canonicalize(raws: &[RawBinnacle]) -> Vec<CanonicalBinnacle> {
    let mut list: Vec<CanonicalBinnacle> = raws.iter().map(canonical).collect();
    list.sort_by_key(|b| b.index);
    list
}

/// Structural validation of an extraction. Entries with an invalid index
/// are dropped; duplicate indices or an extraction that loses every entry
/// to validation are structural failures.
pub fn validate(raws: Vec<RawBinnacle>) -> Result<Vec<RawBinnacle>, AppError> {
    let total = raws.len();
    let kept: Vec<RawBinnacle> = raws.into_iter().filter(|b| b.index >= 1).collect();

    if kept.is_empty() && total > 0 {
        return Err(AppError::ValidationFailed(format!(
            "all {total} extracted entries failed validation"
        )));
    }

    let mut seen = std::collections::HashSet::new();
    for b in &kept {
        if !seen.insert(b.index) {
            return Err(AppError::ValidationFailed(format!(
                "duplicate binnacle index {}",
                b.index
            )));
        }
    }

    if kept.len() < total {
        tracing::warn!(
            dropped = total - kept.len(),
            "Dropped invalid binnacle entries"
        );
    }

    Ok(kept)
}

/// Hash a canonical binnacle list.
///
/// The list is serialized with object keys in lexicographic order (the
/// default `serde_json` map ordering) and hashed with SHA-256. The caller
/// is expected to pass the output of [`canonicalize`], which is already
/// sorted by index, so any permutation of the same entries hashes equally.
pub fn hash_binnacles(list: &[CanonicalBinnacle]) -> Result<String, AppError> {
    let value = serde_json::to_value(list)?;
    let bytes = serde_json::to_string(&value)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Serialize a canonical list into the payload stored on the snapshot.
pub fn canonical_payload(list: &[CanonicalBinnacle]) -> Result<serde_json::Value, AppError> {
    Ok(serde_json::to_value(list)?)
}

/// Build the persistable row for one validated raw binnacle. The kind tag
/// is RESOLUTION exactly when a resolution date is present.
pub fn to_new_binnacle(raw: &RawBinnacle) -> NewBinnacle {
    let resolution_date = parse_portal_date(raw.resolution_date.as_deref());
    NewBinnacle {
        index: raw.index,
        kind: if resolution_date.is_some() {
            BinnacleKind::Resolution
        } else {
            BinnacleKind::Writ
        },
        resolution_date,
        entry_date: parse_portal_date(raw.entry_date.as_deref()),
        resolution: clean_str(raw.resolution.as_deref()),
        notification_type: clean_str(raw.notification_type.as_deref()),
        acto: clean_str(raw.acto.as_deref()),
        fojas: parse_int(raw.fojas.as_deref()),
        folios: parse_int(raw.folios.as_deref()),
        provedio_date: parse_portal_date(raw.provedio_date.as_deref()),
        sumilla: clean_str(raw.sumilla.as_deref()),
        user_description: clean_str(raw.user_description.as_deref()),
        notifications: raw.notifications.iter().map(to_new_notification).collect(),
    }
}

fn to_new_notification(raw: &RawNotification) -> NewNotification {
    NewNotification {
        code: raw.code.trim().to_string(),
        addressee: clean_str(raw.addressee.as_deref()),
        ship_date: parse_portal_date(raw.ship_date.as_deref()),
        attachments: clean_str(raw.attachments.as_deref()),
        delivery_method: clean_str(raw.delivery_method.as_deref()),
        issued_at: parse_portal_date(raw.issued_at.as_deref()),
        dispatched_at: parse_portal_date(raw.dispatched_at.as_deref()),
        delivered_at: parse_portal_date(raw.delivered_at.as_deref()),
        returned_at: parse_portal_date(raw.returned_at.as_deref()),
        received_at: parse_portal_date(raw.received_at.as_deref()),
        acknowledged_at: parse_portal_date(raw.acknowledged_at.as_deref()),
    }
}
