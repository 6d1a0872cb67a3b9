use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use vigia_core::error::AppError;
use vigia_core::model::{
    CaseFileSummary, SnapshotSummary, TenantSchedule, PORTAL_MONITORING_LOGIC_KEY,
};
use vigia_core::traits::PlanStore;

/// Read-side repository for the scheduler: schedules, eligible case files
/// and batched snapshot timestamps.
#[derive(Clone)]
pub struct PlanRepository {
    pool: Pool<Postgres>,
}

impl PlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PlanStore for PlanRepository {
    async fn monitoring_schedules(&self) -> Result<Vec<TenantSchedule>, AppError> {
        let rows: Vec<(Uuid, Vec<NaiveTime>)> = sqlx::query_as(
            r#"
            SELECT s.tenant_id, s.hours
            FROM notification_schedules s
            JOIN tenants t ON t.id = s.tenant_id
            WHERE s.enabled AND s.logic_key = $1 AND t.scrape_enabled
            "#,
        )
        .bind(PORTAL_MONITORING_LOGIC_KEY)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(tenant_id, hours)| TenantSchedule { tenant_id, hours })
            .collect())
    }

    async fn eligible_case_files(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<CaseFileSummary>, AppError> {
        let rows: Vec<(Uuid, Uuid, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, external_case_number, created_at
            FROM case_files
            WHERE tenant_id = $1 AND scrape_enabled AND scan_valid AND NOT archived
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(
                |(id, tenant_id, external_case_number, created_at)| CaseFileSummary {
                    id,
                    tenant_id,
                    external_case_number,
                    created_at,
                },
            )
            .collect())
    }

    async fn snapshots_for(
        &self,
        case_file_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, SnapshotSummary>, AppError> {
        if case_file_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(Uuid, DateTime<Utc>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT case_file_id, last_scraped_at, last_changed_at
            FROM snapshots
            WHERE case_file_id = ANY($1)
            "#,
        )
        .bind(case_file_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(id, last_scraped_at, last_changed_at)| {
                (
                    id,
                    SnapshotSummary {
                        last_scraped_at,
                        last_changed_at,
                    },
                )
            })
            .collect())
    }
}
