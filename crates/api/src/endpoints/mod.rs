//! API endpoints.

mod admin;
mod emails;

use axum::{Json, Router, extract::State};
use serde::Serialize;

use crate::middleware::AppState;

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new().merge(emails::router()).merge(admin::router())
}

/// Liveness probe body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub processor_running: bool,
}

/// Liveness probe, mounted at `/healthz` by the server.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.supervisor.get_status().await;
    Json(HealthResponse {
        status: "ok",
        processor_running: status.running,
    })
}
