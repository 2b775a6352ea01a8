//! Enqueue and inspection endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use postbox_common::AppResult;
use postbox_core::{QueueStats, SendDirectEmailInput, SendUserEmailInput, TemplateDescriptor};
use postbox_db::entities::email_job::{self, EmailPriority, EmailStatus};
use serde::{Deserialize, Serialize};

use crate::{
    extractors::AppJson,
    middleware::AppState,
    response::{ActionResponse, QueuedResponse},
};

/// Enqueue request, discriminated by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SendEmailRequest {
    User(SendUserEmailInput),
    Direct(SendDirectEmailInput),
}

#[derive(Debug, Deserialize)]
pub struct ListEmailsQuery {
    pub status: Option<EmailStatus>,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

const fn default_limit() -> u64 {
    20
}

/// Job record as exposed to operators. Template data is left out since it
/// can carry one-time links.
#[derive(Debug, Serialize)]
pub struct EmailJobResponse {
    pub id: String,
    pub recipient_user_id: Option<String>,
    pub recipient_email: Option<String>,
    pub recipient_name: Option<String>,
    pub template_type: String,
    pub priority: EmailPriority,
    pub status: EmailStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub scheduled_for: String,
    pub created_at: String,
    pub updated_at: String,
    pub sent_at: Option<String>,
}

impl From<email_job::Model> for EmailJobResponse {
    fn from(job: email_job::Model) -> Self {
        Self {
            id: job.id,
            recipient_user_id: job.recipient_user_id,
            recipient_email: job.recipient_email,
            recipient_name: job.recipient_name,
            template_type: job.template_type,
            priority: job.priority,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            scheduled_for: job.scheduled_for.to_rfc3339(),
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
            sent_at: job.sent_at.map(|t| t.to_rfc3339()),
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/emails", post(send_email).get(list_emails))
        .route("/emails/stats", get(stats))
        .route("/emails/templates", get(templates))
        .route("/emails/{id}", get(show_email))
        .route("/emails/{id}/cancel", post(cancel_email))
}

async fn send_email(
    State(state): State<AppState>,
    AppJson(req): AppJson<SendEmailRequest>,
) -> AppResult<QueuedResponse> {
    let email_id = match req {
        SendEmailRequest::User(input) => state.email_service.send_user_email(input).await?,
        SendEmailRequest::Direct(input) => state.email_service.send_direct_email(input).await?,
    };

    Ok(QueuedResponse {
        success: true,
        email_id,
    })
}

async fn list_emails(
    State(state): State<AppState>,
    Query(query): Query<ListEmailsQuery>,
) -> AppResult<Json<Vec<EmailJobResponse>>> {
    let jobs = state
        .email_service
        .list_emails(query.status, query.limit, query.offset)
        .await?;

    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

async fn stats(State(state): State<AppState>) -> AppResult<Json<QueueStats>> {
    Ok(Json(state.email_service.get_stats().await?))
}

async fn templates(State(state): State<AppState>) -> Json<Vec<TemplateDescriptor>> {
    Json(state.email_service.available_templates())
}

async fn show_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<EmailJobResponse>> {
    let job = state.email_service.get_email(&id).await?;
    Ok(Json(job.into()))
}

async fn cancel_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<ActionResponse> {
    state.email_service.cancel_email(&id).await?;
    Ok(ActionResponse::ok(format!("Email {id} cancelled")))
}
