use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use vigia_core::job::{EnqueueRequest, Lane};
use vigia_core::job_store::JobStore;

use crate::auth::require_service_secret;
use crate::dto::{
    CreateJobRequest, CreateJobResponse, HealthChecks, HealthResponse, LaneStatus, StatusResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/jobs/initial", post(create_initial_job))
        .route("/jobs/priority", post(create_priority_job))
        .route("/status", get(status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_service_secret,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/jobs/initial",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job accepted", body = CreateJobResponse),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn create_initial_job(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let today = Utc::now().with_timezone(&state.timezone).date_naive();
    let request = EnqueueRequest::initial(body.case_file_id, body.tenant_id, body.case_number, today);
    accept(&state, request).await
}

#[utoipa::path(
    post,
    path = "/jobs/priority",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job accepted", body = CreateJobResponse),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn create_priority_job(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = EnqueueRequest::priority(
        body.case_file_id,
        body.tenant_id,
        body.case_number,
        Utc::now(),
    );
    accept(&state, request).await
}

async fn accept(
    state: &AppState,
    request: EnqueueRequest,
) -> Result<(StatusCode, axum::Json<CreateJobResponse>), ApiError> {
    let lane = request.lane;
    let dedup_key = request.dedup_key.clone();
    let job_id = state.jobs.enqueue(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        axum::Json(CreateJobResponse {
            job_id,
            lane: lane.to_string(),
            dedup_key,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, description = "Queue and pool status", body = StatusResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let mut counts = state.jobs.lane_counts().await?;

    let lanes = Lane::ALL
        .into_iter()
        .map(|lane| LaneStatus::new(lane.to_string(), counts.remove(&lane).unwrap_or_default()))
        .collect();

    let response = StatusResponse {
        lanes,
        browser_pool: state.pool.as_ref().map(|p| p.stats()),
        rate_limit_tokens: state.jobs.bucket().available(),
    };

    Ok(axum::Json(response))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match state.db.health_check().await {
        Ok(()) => "ok",
        Err(_) => "error",
    };
    let queue_store = match state.db.queue_health_check().await {
        Ok(()) => "ok",
        Err(_) => "error",
    };
    let browser_pool = match &state.pool {
        Some(pool) if !pool.is_draining() => "ok",
        Some(_) => "error",
        None => "disabled",
    };

    let healthy = database == "ok" && queue_store == "ok" && browser_pool != "error";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        uptime: state.started_at.elapsed().as_secs(),
        checks: HealthChecks {
            database,
            queue_store,
            browser_pool,
        },
    };

    (status, axum::Json(response))
}

/// Prometheus text exposition. Unauthenticated, like `/health`.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}
