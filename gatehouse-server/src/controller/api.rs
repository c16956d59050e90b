//! Controller api-plane routes.
//!
//! The api plane hosts the health probe and the operator endpoint that
//! countersigns worker-led enrollment requests. The broader public API
//! surface is served elsewhere; only what the lifecycle core needs lives
//! here.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use super::ControlPlane;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    controller: String,
    version: &'static str,
}

#[derive(Deserialize)]
struct ApprovalRequest {
    /// Base64 auth request token as published by the worker.
    token: String,
}

#[derive(Serialize)]
struct ApprovalError {
    error: String,
}

/// Build the api-plane router.
pub fn router(plane: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/worker-auth/approvals", post(approve))
        .with_state(plane)
}

async fn health(State(plane): State<Arc<ControlPlane>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        controller: plane.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn approve(
    State(plane): State<Arc<ControlPlane>>,
    Json(request): Json<ApprovalRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApprovalError>)> {
    match plane.approve_auth_request(&request.token).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tracing::warn!(error = %e, "worker auth approval rejected");
            Err((
                StatusCode::BAD_REQUEST,
                Json(ApprovalError {
                    error: e.to_string(),
                }),
            ))
        }
    }
}
