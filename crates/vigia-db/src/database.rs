use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use vigia_core::AppError;

use crate::config::DatabaseConfig;
use crate::job_log_repository::JobLogRepository;
use crate::job_repository::JobRepository;
use crate::plan_repository::PlanRepository;
use crate::scrape_repository::ScrapeRepository;

/// Central database facade — owns the connection pool, runs migrations,
/// and vends repository instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`PlanRepository`] backed by this pool.
    pub fn plan_repo(&self) -> PlanRepository {
        PlanRepository::new(self.pool.clone())
    }

    /// Get a [`ScrapeRepository`] backed by this pool.
    pub fn scrape_repo(&self) -> ScrapeRepository {
        ScrapeRepository::new(self.pool.clone())
    }

    /// Get a [`JobRepository`] backed by this pool.
    pub fn job_repo(&self) -> JobRepository {
        JobRepository::new(self.pool.clone())
    }

    /// Get a [`JobLogRepository`] backed by this pool.
    pub fn job_log_repo(&self) -> JobLogRepository {
        JobLogRepository::new(self.pool.clone())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Check the job-queue tables are reachable.
    pub async fn queue_health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT COUNT(*) FROM scrape_jobs WHERE state = 'active'")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
