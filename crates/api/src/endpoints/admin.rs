//! Processor control endpoint.

use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
};
use postbox_common::AppResult;
use postbox_core::QueueStats;
use postbox_queue::ProcessorStatus;
use serde::{Deserialize, Serialize};

use crate::{extractors::AppJson, middleware::AppState, response::ActionResponse};

/// Control action for the email processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessorAction {
    Start,
    Stop,
    Status,
    Process,
    RetryFailed,
}

/// Control request.
#[derive(Debug, Deserialize)]
pub struct ProcessorActionRequest {
    pub action: ProcessorAction,
}

/// Reply to the `status` action.
#[derive(Debug, Serialize)]
pub struct ProcessorStatusResponse {
    pub processor_status: ProcessorStatus,
    pub queue_stats: QueueStats,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/admin/email-processor", post(email_processor))
}

async fn email_processor(
    State(state): State<AppState>,
    AppJson(req): AppJson<ProcessorActionRequest>,
) -> AppResult<Response> {
    tracing::info!(action = ?req.action, "Email processor action requested");

    let response = match req.action {
        ProcessorAction::Start => {
            if state.supervisor.start_processor().await {
                ActionResponse::ok("Email processor started")
            } else {
                ActionResponse::noop("Email processor is already running")
            }
        }
        ProcessorAction::Stop => {
            if state.supervisor.stop_processor().await {
                ActionResponse::ok("Email processor stopped")
            } else {
                ActionResponse::noop("Email processor is not running")
            }
        }
        ProcessorAction::Status => {
            let processor_status = state.supervisor.get_status().await;
            let queue_stats = state.email_service.get_stats().await?;
            return Ok(Json(ProcessorStatusResponse {
                processor_status,
                queue_stats,
            })
            .into_response());
        }
        ProcessorAction::Process => {
            let summary = state.supervisor.process_queue_now().await?;
            ActionResponse::ok(format!(
                "Processed {} emails: {} sent, {} failed, {} requeued",
                summary.claimed, summary.sent, summary.failed, summary.requeued
            ))
        }
        ProcessorAction::RetryFailed => {
            let count = state.supervisor.retry_failed_emails().await?;
            ActionResponse::ok(format!("Queued {count} failed emails for retry"))
        }
    };

    Ok(response.into_response())
}
