use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use vigia_core::breaker::{BreakerConfig, PortalBreaker};
use vigia_core::job::WorkerConfig;
use vigia_core::JobStore;
use vigia_core::rate_limit::{RateLimitedJobStore, TokenBucket};
use vigia_core::scheduler::Scheduler;
use vigia_core::worker::{LaneGate, TracingWorkerReporter, WorkerService};
use vigia_db::{Database, DatabaseConfig};
use vigia_portal::{
    AudioCodeStrategy, BrowserPool, CaptchaChain, CaptchaStrategy, FsObjectStore,
    HostedChallengeStrategy, ImageCaptchaStrategy, PortalClient, SolverClient,
};
use vigia_server::config::ServiceConfig;
use vigia_server::routes;
use vigia_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vigia=info".parse()?))
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env()?;

    // Startup failure here is exit code 1: the service is useless without
    // its store.
    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;

    let metrics_handle = vigia_server::metrics::install()?;

    let bucket = TokenBucket::new(config.rate_limit());
    let jobs = RateLimitedJobStore::new(db.job_repo(), bucket);

    let pool = BrowserPool::new(config.browser_pool());
    let chain = build_captcha_chain(&config)?;
    let portal = PortalClient::new(pool.clone(), chain, config.portal());
    let objects = FsObjectStore::new(&config.object_store_root);

    let cancel = CancellationToken::new();

    // Scheduler task.
    let scheduler = Scheduler::new(db.plan_repo(), jobs.clone(), config.scheduler());
    let scheduler_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    // Worker fleet.
    let gate = LaneGate::with_defaults(config.worker_concurrency);
    let breaker = PortalBreaker::new(BreakerConfig::default());
    let mut workers = JoinSet::new();
    let mut worker_ids = Vec::new();
    for i in 0..config.worker_concurrency {
        let worker_id = format!("vigia-{i}-{}", &Uuid::new_v4().to_string()[..8]);
        worker_ids.push(worker_id.clone());

        let service = WorkerService::new(
            jobs.clone(),
            portal.clone(),
            db.scrape_repo(),
            objects.clone(),
            db.job_log_repo(),
            breaker.clone(),
            gate.clone(),
            WorkerConfig::default().with_worker_id(worker_id),
            config.attachment_prefix.clone(),
        );
        let cancel = cancel.clone();
        workers.spawn(async move { service.run(cancel, &TracingWorkerReporter).await });
    }

    // HTTP boundary.
    let state = Arc::new(AppState {
        db: db.clone(),
        jobs: jobs.clone(),
        pool: Some(pool.clone()),
        service_secret: config.service_secret.clone(),
        timezone: config.timezone,
        started_at: Instant::now(),
        metrics: Some(metrics_handle),
    });

    let cors = match &config.cors_origin {
        Some(origin) if origin == "*" => CorsLayer::permissive(),
        Some(origin) => {
            let origins: Vec<HeaderValue> = origin
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        }
        None => CorsLayer::new(),
    };

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(
        %addr,
        workers = config.worker_concurrency,
        pool_size = config.browser_pool_size,
        timezone = %config.timezone,
        "Starting vigia"
    );
    let listener = TcpListener::bind(&addr).await?;

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    shutdown_signal().await;
    cancel.cancel();

    // Workers finish their in-flight job, then stop. Past the deadline,
    // claimed jobs go back to pending for another process to retry.
    let drained = tokio::time::timeout(config.shutdown_deadline, async {
        while workers.join_next().await.is_some() {}
        let _ = scheduler_handle.await;
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            deadline_secs = config.shutdown_deadline.as_secs(),
            "Shutdown deadline exceeded; releasing claimed jobs"
        );
        workers.abort_all();
        for worker_id in &worker_ids {
            if let Err(e) = jobs.release_worker_jobs(worker_id).await {
                tracing::error!(%worker_id, error = %e, "Failed to release jobs");
            }
        }
    }

    if tokio::time::timeout(config.shutdown_deadline, pool.drain())
        .await
        .is_err()
    {
        tracing::warn!("Browser pool drain timed out; processes die with the service");
    }

    let _ = server_handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn build_captcha_chain(config: &ServiceConfig) -> anyhow::Result<CaptchaChain> {
    let mut strategies: Vec<Arc<dyn CaptchaStrategy>> = vec![Arc::new(AudioCodeStrategy)];

    if let Some(key) = &config.image_solver_key {
        let solver = SolverClient::new(key, &config.solver_base_url)?;
        strategies.push(Arc::new(ImageCaptchaStrategy::new(solver)));
    } else {
        tracing::warn!("VIGIA_IMAGE_SOLVER_KEY not set; image CAPTCHA strategy disabled");
    }

    if let Some(key) = &config.token_solver_key {
        let solver = SolverClient::new(key, &config.solver_base_url)?;
        strategies.push(Arc::new(HostedChallengeStrategy::new(solver)));
    } else {
        tracing::warn!("VIGIA_TOKEN_SOLVER_KEY not set; hosted-challenge strategy disabled");
    }

    Ok(CaptchaChain::new(strategies))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
}
