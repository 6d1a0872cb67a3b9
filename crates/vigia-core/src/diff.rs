//! Structured diffing between the stored snapshot and a fresh extraction.
//!
//! The fast path is a hash comparison; only on a hash mismatch is the
//! field-level diff computed. Entries are keyed by
//! `(resolution_date, entry_date, resolution)` — the identity of a timeline
//! entry on the portal — rather than by index, so insertions in the middle
//! of the timeline do not cascade into spurious modifications.

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::model::{ChangeType, NewChangeLogEntry};
use crate::normalize::{hash_binnacles, CanonicalBinnacle};

/// Fields compared for a matched entry, in emission order.
const COMPARED_FIELDS: &[&str] = &[
    "notification_type",
    "acto",
    "fojas",
    "folios",
    "provedio_date",
    "sumilla",
    "user_description",
    "notification_count",
];

/// Result of running change detection for one case file.
#[derive(Debug, Clone)]
pub struct Detection {
    pub is_first_scrape: bool,
    pub has_changes: bool,
    pub new_hash: String,
    pub old_hash: String,
    pub changes: Vec<NewChangeLogEntry>,
}

fn key(b: &CanonicalBinnacle) -> (Option<&str>, Option<&str>, Option<&str>) {
    (
        b.resolution_date.as_deref(),
        b.entry_date.as_deref(),
        b.resolution.as_deref(),
    )
}

fn field_value(b: &CanonicalBinnacle, field: &str) -> Option<String> {
    match field {
        "notification_type" => b.notification_type.clone(),
        "acto" => b.acto.clone(),
        "fojas" => b.fojas.map(|v| v.to_string()),
        "folios" => b.folios.map(|v| v.to_string()),
        "provedio_date" => b.provedio_date.clone(),
        "sumilla" => b.sumilla.clone(),
        "user_description" => b.user_description.clone(),
        "notification_count" => Some(b.notification_count.to_string()),
        _ => None,
    }
}

/// Compute the structured diff between two canonical lists.
///
/// New entries are visited in index order, then unmatched old entries in
/// their original insertion order, so the emitted sequence is
/// deterministic. Every entry carries the same `detected_at`.
pub fn diff(
    old: &[CanonicalBinnacle],
    new: &[CanonicalBinnacle],
    detected_at: DateTime<Utc>,
) -> Vec<NewChangeLogEntry> {
    let mut changes = Vec::new();
    let mut matched = vec![false; old.len()];

    for entry in new {
        let found = old
            .iter()
            .enumerate()
            .find(|(i, o)| !matched[*i] && key(o) == key(entry));

        match found {
            None => changes.push(NewChangeLogEntry {
                change_type: ChangeType::NewBinnacle,
                field_name: None,
                old_value: None,
                new_value: entry.resolution.clone().or(entry.entry_date.clone()),
                detected_at,
            }),
            Some((i, prior)) => {
                matched[i] = true;
                for field in COMPARED_FIELDS {
                    let before = field_value(prior, field);
                    let after = field_value(entry, field);
                    if before != after {
                        changes.push(NewChangeLogEntry {
                            change_type: ChangeType::ModifiedBinnacle,
                            field_name: Some((*field).to_string()),
                            old_value: before,
                            new_value: after,
                            detected_at,
                        });
                    }
                }
            }
        }
    }

    for (i, prior) in old.iter().enumerate() {
        if !matched[i] {
            changes.push(NewChangeLogEntry {
                change_type: ChangeType::RemovedBinnacle,
                field_name: None,
                old_value: prior.resolution.clone().or(prior.entry_date.clone()),
                new_value: None,
                detected_at,
            });
        }
    }

    changes
}

/// Run change detection against the stored snapshot.
///
/// The first scrape counts as a change (the snapshot must be written) but
/// emits no change-log entries: the initial state is not a "change".
pub fn detect(
    prev_payload: Option<&serde_json::Value>,
    prev_hash: &str,
    new: &[CanonicalBinnacle],
    detected_at: DateTime<Utc>,
) -> Result<Detection, AppError> {
    let new_hash = hash_binnacles(new)?;

    let prev_payload = match prev_payload {
        Some(v) if !v.is_null() => v,
        _ => {
            return Ok(Detection {
                is_first_scrape: true,
                has_changes: true,
                new_hash,
                old_hash: String::new(),
                changes: Vec::new(),
            });
        }
    };

    if new_hash == prev_hash {
        return Ok(Detection {
            is_first_scrape: false,
            has_changes: false,
            new_hash,
            old_hash: prev_hash.to_string(),
            changes: Vec::new(),
        });
    }

    let old: Vec<CanonicalBinnacle> = serde_json::from_value(prev_payload.clone())?;
    let changes = diff(&old, new, detected_at);

    Ok(Detection {
        is_first_scrape: false,
        has_changes: true,
        new_hash,
        old_hash: prev_hash.to_string(),
        changes,
    })
}
