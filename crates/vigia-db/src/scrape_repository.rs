use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use vigia_core::error::AppError;
use vigia_core::model::{CaseContext, ScrapeOutcome, Snapshot};
use vigia_core::traits::ScrapeStore;

/// Write-side repository for the worker.
///
/// `persist_scrape` is the only write path for binnacles, notifications,
/// attachments, snapshots and change-log entries; everything commits in a
/// single transaction so concurrent jobs on the same case file serialize
/// at the database (last committer wins on the snapshot, binnacle upserts
/// are idempotent).
#[derive(Clone)]
pub struct ScrapeRepository {
    pool: Pool<Postgres>,
}

impl ScrapeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    case_file_id: Uuid,
    content_hash: String,
    binnacle_count: i32,
    canonical_payload: serde_json::Value,
    last_scraped_at: DateTime<Utc>,
    last_changed_at: Option<DateTime<Utc>>,
    scrape_count: i32,
    consecutive_no_change: i32,
    error_count: i32,
    last_error: Option<String>,
}

impl From<SnapshotRow> for Snapshot {
    fn from(row: SnapshotRow) -> Self {
        Snapshot {
            case_file_id: row.case_file_id,
            content_hash: row.content_hash,
            binnacle_count: row.binnacle_count,
            canonical_payload: row.canonical_payload,
            last_scraped_at: row.last_scraped_at,
            last_changed_at: row.last_changed_at,
            scrape_count: row.scrape_count,
            consecutive_no_change: row.consecutive_no_change,
            error_count: row.error_count,
            last_error: row.last_error,
        }
    }
}

impl ScrapeStore for ScrapeRepository {
    async fn case_context(&self, case_file_id: Uuid) -> Result<CaseContext, AppError> {
        let row: Option<(Uuid, Uuid, String, String)> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, external_case_number, party_name
            FROM case_files
            WHERE id = $1
            "#,
        )
        .bind(case_file_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let (id, tenant_id, external_case_number, party_name) = row.ok_or_else(|| {
            AppError::DatabaseError(format!("case file not found: {case_file_id}"))
        })?;

        let attachment_rows: Vec<(i32, String)> = sqlx::query_as(
            r#"
            SELECT b.entry_index, fa.original_name
            FROM file_attachments fa
            JOIN binnacles b ON b.id = fa.binnacle_id
            WHERE b.case_file_id = $1
            "#,
        )
        .bind(case_file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut existing_attachments: HashMap<u32, HashSet<String>> = HashMap::new();
        for (index, name) in attachment_rows {
            existing_attachments
                .entry(index as u32)
                .or_default()
                .insert(name);
        }

        Ok(CaseContext {
            case_file_id: id,
            tenant_id,
            external_case_number,
            party_name,
            existing_attachments,
        })
    }

    async fn snapshot(&self, case_file_id: Uuid) -> Result<Option<Snapshot>, AppError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"SELECT * FROM snapshots WHERE case_file_id = $1"#,
        )
        .bind(case_file_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn persist_scrape(&self, outcome: &ScrapeOutcome) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        // Binnacle upserts by (case_file, index). Indices absent from the
        // new extraction are left untouched; removals only surface in the
        // change log.
        let mut binnacle_ids: HashMap<u32, Uuid> = HashMap::new();
        for binnacle in &outcome.binnacles {
            let (id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO binnacles
                    (case_file_id, entry_index, kind, resolution_date, entry_date, resolution,
                     notification_type, acto, fojas, folios, provedio_date, sumilla,
                     user_description)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (case_file_id, entry_index) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    resolution_date = EXCLUDED.resolution_date,
                    entry_date = EXCLUDED.entry_date,
                    resolution = EXCLUDED.resolution,
                    notification_type = EXCLUDED.notification_type,
                    acto = EXCLUDED.acto,
                    fojas = EXCLUDED.fojas,
                    folios = EXCLUDED.folios,
                    provedio_date = EXCLUDED.provedio_date,
                    sumilla = EXCLUDED.sumilla,
                    user_description = EXCLUDED.user_description,
                    updated_at = NOW()
                RETURNING id
                "#,
            )
            .bind(outcome.case_file_id)
            .bind(binnacle.index as i32)
            .bind(binnacle.kind.as_str())
            .bind(binnacle.resolution_date)
            .bind(binnacle.entry_date)
            .bind(&binnacle.resolution)
            .bind(&binnacle.notification_type)
            .bind(&binnacle.acto)
            .bind(binnacle.fojas)
            .bind(binnacle.folios)
            .bind(binnacle.provedio_date)
            .bind(&binnacle.sumilla)
            .bind(&binnacle.user_description)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            binnacle_ids.insert(binnacle.index, id);
        }

        // Notifications: the portal is the source of truth, so each scrape
        // replaces the binnacle's notification set wholesale.
        for binnacle in &outcome.binnacles {
            let Some(binnacle_id) = binnacle_ids.get(&binnacle.index) else {
                continue;
            };

            sqlx::query(r#"DELETE FROM notifications WHERE binnacle_id = $1"#)
                .bind(binnacle_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            for notification in &binnacle.notifications {
                sqlx::query(
                    r#"
                    INSERT INTO notifications
                        (binnacle_id, code, addressee, ship_date, attachments,
                         delivery_method, issued_at, dispatched_at, delivered_at,
                         returned_at, received_at, acknowledged_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    "#,
                )
                .bind(binnacle_id)
                .bind(&notification.code)
                .bind(&notification.addressee)
                .bind(notification.ship_date)
                .bind(&notification.attachments)
                .bind(&notification.delivery_method)
                .bind(notification.issued_at)
                .bind(notification.dispatched_at)
                .bind(notification.delivered_at)
                .bind(notification.returned_at)
                .bind(notification.received_at)
                .bind(notification.acknowledged_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            }
        }

        for attachment in &outcome.attachments {
            let Some(binnacle_id) = binnacle_ids.get(&attachment.binnacle_index) else {
                tracing::warn!(
                    binnacle_index = attachment.binnacle_index,
                    "Attachment references an unknown binnacle index; skipping"
                );
                continue;
            };

            sqlx::query(
                r#"
                INSERT INTO file_attachments (binnacle_id, original_name, size, object_store_key)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (binnacle_id, original_name) DO NOTHING
                "#,
            )
            .bind(binnacle_id)
            .bind(&attachment.original_name)
            .bind(attachment.size)
            .bind(&attachment.object_store_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        }

        // Snapshot upsert: exactly one row per case file, ever. A
        // successful scrape clears the error counters.
        sqlx::query(
            r#"
            INSERT INTO snapshots
                (case_file_id, content_hash, binnacle_count, canonical_payload,
                 last_scraped_at, last_changed_at, scrape_count, consecutive_no_change,
                 error_count, last_error)
            VALUES ($1, $2, $3, $4, $5,
                    CASE WHEN $6 THEN $5 ELSE NULL END,
                    1, 0, 0, NULL)
            ON CONFLICT (case_file_id) DO UPDATE SET
                content_hash = EXCLUDED.content_hash,
                binnacle_count = EXCLUDED.binnacle_count,
                canonical_payload = EXCLUDED.canonical_payload,
                last_scraped_at = EXCLUDED.last_scraped_at,
                last_changed_at = CASE
                    WHEN $6 THEN EXCLUDED.last_scraped_at
                    ELSE snapshots.last_changed_at
                END,
                scrape_count = snapshots.scrape_count + 1,
                consecutive_no_change = CASE
                    WHEN $6 THEN 0
                    ELSE snapshots.consecutive_no_change + 1
                END,
                error_count = 0,
                last_error = NULL
            "#,
        )
        .bind(outcome.case_file_id)
        .bind(&outcome.content_hash)
        .bind(outcome.binnacles.len() as i32)
        .bind(&outcome.canonical_payload)
        .bind(outcome.scraped_at)
        .bind(outcome.has_changes)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        for change in &outcome.changes {
            sqlx::query(
                r#"
                INSERT INTO change_log
                    (case_file_id, tenant_id, change_type, field_name, old_value,
                     new_value, detected_at, notified)
                VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
                "#,
            )
            .bind(outcome.case_file_id)
            .bind(outcome.tenant_id)
            .bind(change.change_type.as_str())
            .bind(&change.field_name)
            .bind(&change.old_value)
            .bind(&change.new_value)
            .bind(change.detected_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        }

        // The first scrape is not a pending change: there is nothing for
        // the dispatcher to announce.
        let pending = outcome.has_changes && !outcome.is_first_scrape;
        sqlx::query(
            r#"
            UPDATE case_files
            SET last_scraped_at = $2, has_pending_changes = $3, was_scanned = TRUE
            WHERE id = $1
            "#,
        )
        .bind(outcome.case_file_id)
        .bind(outcome.scraped_at)
        .bind(pending)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn mark_scan_invalid(&self, case_file_id: Uuid) -> Result<(), AppError> {
        sqlx::query(r#"UPDATE case_files SET scan_valid = FALSE WHERE id = $1"#)
            .bind(case_file_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn record_scrape_error(
        &self,
        case_file_id: Uuid,
        error_kind: &str,
        error_message: &str,
    ) -> Result<(), AppError> {
        // No snapshot yet means no row to annotate; the job log still
        // carries the failure.
        sqlx::query(
            r#"
            UPDATE snapshots
            SET last_error = $2 || ': ' || $3, error_count = error_count + 1
            WHERE case_file_id = $1
            "#,
        )
        .bind(case_file_id)
        .bind(error_kind)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}
