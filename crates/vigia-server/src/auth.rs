//! Bearer-token gate for the control surface.
//!
//! Job submission and queue status are operator-only; health and metrics
//! stay open for probes. A single shared secret authenticates the
//! operator tooling.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::unauthorized;
use crate::state::AppState;

/// Pull the token out of an `Authorization: Bearer …` header value.
fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub async fn require_service_secret(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let presented: Option<String> = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);

    match presented {
        Some(token) if token == state.service_secret => next.run(request).await,
        Some(_) => {
            tracing::warn!(
                path = %request.uri().path(),
                "Rejected request with wrong service secret"
            );
            unauthorized()
        }
        None => unauthorized(),
    }
}
