use sqlx::{PgPool, Pool, Postgres};

use vigia_core::error::AppError;
use vigia_core::model::NewJobLogEntry;
use vigia_core::traits::JobLog;

/// Append-only job-attempt log.
#[derive(Clone)]
pub struct JobLogRepository {
    pool: Pool<Postgres>,
}

impl JobLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl JobLog for JobLogRepository {
    async fn record(&self, entry: NewJobLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO job_log
                (case_file_id, tenant_id, lane, status, attempt, duration_ms,
                 binnacles_found, changes_detected, error_kind, error_message,
                 worker_id, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.case_file_id)
        .bind(entry.tenant_id)
        .bind(entry.lane.as_str())
        .bind(entry.status.as_str())
        .bind(entry.attempt as i32)
        .bind(entry.duration_ms)
        .bind(entry.binnacles_found)
        .bind(entry.changes_detected)
        .bind(&entry.error_kind)
        .bind(&entry.error_message)
        .bind(&entry.worker_id)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }
}
