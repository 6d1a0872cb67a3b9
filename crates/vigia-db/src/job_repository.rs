use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use vigia_core::error::AppError;
use vigia_core::job::{EnqueueRequest, JobState, Lane, Priority, ScrapeJob};
use vigia_core::job_store::{JobStore, LaneCounts};

/// PostgreSQL-backed three-lane job queue using
/// `SELECT FOR UPDATE SKIP LOCKED`.
///
/// Dedup is enforced by a partial unique index on `dedup_key` over the
/// non-terminal states, so concurrent producers racing on the same key
/// resolve inside the database rather than in application code.
#[derive(Clone)]
pub struct JobRepository {
    pool: Pool<Postgres>,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    lane: String,
    case_file_id: Uuid,
    tenant_id: Uuid,
    case_number: String,
    priority: i16,
    dedup_key: String,
    attempt: i32,
    max_attempts: i32,
    state: String,
    deadline: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
}

impl From<JobRow> for ScrapeJob {
    fn from(row: JobRow) -> Self {
        ScrapeJob {
            id: row.id,
            lane: row.lane.parse().unwrap_or(Lane::Monitor),
            case_file_id: row.case_file_id,
            tenant_id: row.tenant_id,
            case_number: row.case_number,
            priority: Priority::from_i16(row.priority),
            dedup_key: row.dedup_key,
            attempt: row.attempt as u32,
            max_attempts: row.max_attempts as u32,
            state: row.state.parse().unwrap_or(JobState::Pending),
            deadline: row.deadline,
            next_run_at: row.next_run_at,
            last_error: row.last_error,
            enqueued_at: row.enqueued_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            worker_id: row.worker_id,
        }
    }
}

impl JobStore for JobRepository {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, AppError> {
        // Two passes cover the race where the holder of the key reaches a
        // terminal state between our insert attempt and the lookup.
        for _ in 0..2 {
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO scrape_jobs
                    (lane, case_file_id, tenant_id, case_number, priority, dedup_key, deadline)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (dedup_key)
                    WHERE state IN ('pending', 'active', 'delayed')
                    DO NOTHING
                RETURNING id
                "#,
            )
            .bind(request.lane.as_str())
            .bind(request.case_file_id)
            .bind(request.tenant_id)
            .bind(&request.case_number)
            .bind(request.priority.as_i16())
            .bind(&request.dedup_key)
            .bind(request.deadline)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            if let Some((id,)) = inserted {
                return Ok(id);
            }

            let existing: Option<(Uuid,)> = sqlx::query_as(
                r#"
                SELECT id FROM scrape_jobs
                WHERE dedup_key = $1 AND state IN ('pending', 'active', 'delayed')
                LIMIT 1
                "#,
            )
            .bind(&request.dedup_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            if let Some((id,)) = existing {
                return Ok(id);
            }
        }

        Err(AppError::DatabaseError(format!(
            "enqueue raced out for dedup key {}",
            request.dedup_key
        )))
    }

    async fn next_ready(
        &self,
        worker_id: &str,
        lanes: &[Lane],
    ) -> Result<Option<ScrapeJob>, AppError> {
        if lanes.is_empty() {
            return Ok(None);
        }
        let lane_names: Vec<String> = lanes.iter().map(|l| l.as_str().to_string()).collect();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE scrape_jobs
            SET state = 'active', worker_id = $1, attempt = attempt + 1,
                started_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM scrape_jobs
                WHERE lane = ANY($2)
                  AND (state = 'pending'
                       OR (state = 'delayed' AND next_run_at <= NOW()))
                ORDER BY
                    CASE lane
                        WHEN 'priority' THEN 0
                        WHEN 'initial' THEN 1
                        ELSE 2
                    END,
                    priority ASC,
                    enqueued_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(&lane_names)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET state = 'completed', completed_at = NOW(), updated_at = NOW(),
                last_error = NULL, worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error_kind: &str,
        error_message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        // With retry_at set the job parks in `delayed` until then;
        // otherwise it is permanently failed.
        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET
                state = CASE WHEN $4::timestamptz IS NOT NULL THEN 'delayed' ELSE 'failed' END,
                next_run_at = $4,
                last_error = $2 || ': ' || $3,
                completed_at = CASE WHEN $4::timestamptz IS NULL THEN NOW() ELSE completed_at END,
                updated_at = NOW(),
                worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error_kind)
        .bind(error_message)
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET state = 'pending', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE worker_id = $1 AND state = 'active'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn count(&self, lane: Lane, state: JobState) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM scrape_jobs WHERE lane = $1 AND state = $2"#,
        )
        .bind(lane.as_str())
        .bind(state.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count)
    }

    async fn lane_counts(&self) -> Result<HashMap<Lane, LaneCounts>, AppError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"SELECT lane, state, COUNT(*) FROM scrape_jobs GROUP BY lane, state"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut counts: HashMap<Lane, LaneCounts> = HashMap::new();
        for (lane, state, count) in rows {
            let (Ok(lane), Ok(state)) = (lane.parse::<Lane>(), state.parse::<JobState>()) else {
                continue;
            };
            let entry = counts.entry(lane).or_default();
            match state {
                JobState::Pending => entry.pending = count,
                JobState::Active => entry.active = count,
                JobState::Delayed => entry.delayed = count,
                JobState::Completed => entry.completed = count,
                JobState::Failed => entry.failed = count,
            }
        }
        Ok(counts)
    }
}
