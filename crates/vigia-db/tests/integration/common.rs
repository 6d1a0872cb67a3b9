use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use uuid::Uuid;

use vigia_db::Database;

/// Spin up a PostgreSQL container, run migrations and return the pool. The
/// container handle must stay alive for the duration of the test.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = start_postgres().await;
    let pool = connect_to_container(&container).await;

    let db = Database::from_pool(pool.clone());
    db.migrate().await.expect("Failed to run migrations");

    (pool, container)
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

/// Insert a tenant with scraping enabled. Returns its id.
pub async fn seed_tenant(pool: &PgPool) -> Uuid {
    let (id,): (Uuid,) =
        sqlx::query_as(r#"INSERT INTO tenants (name) VALUES ('Banco de Prueba') RETURNING id"#)
            .fetch_one(pool)
            .await
            .expect("Failed to seed tenant");
    id
}

/// Insert an eligible case file for the tenant. Returns its id.
pub async fn seed_case_file(pool: &PgPool, tenant_id: Uuid, case_number: &str) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO case_files (tenant_id, external_case_number, party_name)
        VALUES ($1, $2, 'BANCO DE PRUEBA S.A.')
        RETURNING id
        "#,
    )
    .bind(tenant_id)
    .bind(case_number)
    .fetch_one(pool)
    .await
    .expect("Failed to seed case file");
    id
}
