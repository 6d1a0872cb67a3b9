use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use vigia_core::rate_limit::{RateLimitConfig, RateLimitedJobStore, TokenBucket};
use vigia_db::Database;
use vigia_server::routes;
use vigia_server::state::AppState;

pub const TEST_SECRET: &str = "test-secret-key";

/// Spin up a PostgreSQL container and return the wired router. No browser
/// pool and no metrics recorder: the API surface under test does not need
/// them.
pub async fn setup_test_app() -> (Router, PgPool, ContainerAsync<GenericImage>) {
    let container = start_postgres().await;
    let pool = connect_to_container(&container).await;

    let db = Database::from_pool(pool.clone());
    db.migrate().await.expect("Failed to run migrations");

    let jobs = RateLimitedJobStore::new(
        db.job_repo(),
        TokenBucket::new(RateLimitConfig::default()),
    );

    let state = Arc::new(AppState {
        db,
        jobs,
        pool: None,
        service_secret: TEST_SECRET.to_string(),
        timezone: chrono_tz::America::Lima,
        started_at: Instant::now(),
        metrics: None,
    });

    (routes::router(state), pool, container)
}

async fn start_postgres() -> ContainerAsync<GenericImage> {
    GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "vigia_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container")
}

async fn connect_to_container(container: &ContainerAsync<GenericImage>) -> PgPool {
    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let url = format!("postgresql://postgres:postgres@{host}:{port}/vigia_test");
    retry_connect(&url).await
}

async fn retry_connect(url: &str) -> PgPool {
    let mut delay = std::time::Duration::from_millis(100);
    let max_delay = std::time::Duration::from_secs(2);
    let mut last_err = None;

    for _ in 0..60 {
        match PgPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => return pool,
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, max_delay);
            }
        }
    }
    panic!(
        "Failed to connect to test database at {url}: {:?}",
        last_err
    );
}
