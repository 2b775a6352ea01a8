//! Email queue service.
//!
//! Producers enqueue jobs and return immediately; delivery happens later in
//! [`EmailService::process_queue`], driven by the queue processor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postbox_common::{AppError, AppResult, IdGenerator, SharedClock, SystemClock};
use postbox_db::{
    entities::email_job::{self, EmailPriority, EmailStatus},
    repositories::{EmailJobRepository, UserRepository},
};
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use validator::{Validate, ValidateEmail};

use crate::services::provider::{DeliveryReceipt, EmailProvider, OutgoingEmail, ProviderError};
use crate::services::retry::RetryConfig;
use crate::services::template::{TemplateDescriptor, TemplateEngine, TemplateError};

/// Default age after which a claimed job is considered abandoned.
pub const DEFAULT_STALE_CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// Input for queueing an email to an internal user.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SendUserEmailInput {
    #[validate(length(min = 1, message = "recipient_id is required"))]
    pub recipient_id: String,
    #[validate(length(min = 1, message = "template_type is required"))]
    pub template_type: String,
    #[serde(default)]
    pub template_data: Value,
    #[serde(default)]
    pub priority: EmailPriority,
    /// Earliest send time; defaults to now.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[validate(range(min = 1, max = 100))]
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Input for queueing an email to an explicit address.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SendDirectEmailInput {
    #[validate(email(message = "recipient_email must be an email address"))]
    pub recipient_email: String,
    #[validate(length(max = 256))]
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[validate(length(min = 1, message = "template_type is required"))]
    pub template_type: String,
    #[serde(default)]
    pub template_data: Value,
    #[serde(default)]
    pub priority: EmailPriority,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[validate(range(min = 1, max = 100))]
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Why a delivery attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    /// The job cannot be delivered as written (bad recipient, unknown user).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl JobFailure {
    /// Whether the job should be requeued with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Validation(_) | Self::Template(_) => false,
        }
    }
}

/// Result of one `process_queue` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub requeued: usize,
    /// Stale claims returned to `pending` before claiming.
    pub recovered: u64,
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
    pub oldest_pending_age_seconds: Option<i64>,
    /// `failed / (sent + failed)`, 0 when nothing has finished.
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Requeued,
    Failed,
    /// The claim was recovered by someone else; nothing was written.
    ClaimLost,
}

enum Recipient {
    User(String),
    Direct {
        email: String,
        name: Option<String>,
    },
}

/// Email queue service.
#[derive(Clone)]
pub struct EmailService {
    job_repo: EmailJobRepository,
    user_repo: UserRepository,
    templates: Arc<TemplateEngine>,
    provider: Arc<dyn EmailProvider>,
    retry: RetryConfig,
    clock: SharedClock,
    stale_claim_timeout: Duration,
    id_gen: IdGenerator,
}

impl EmailService {
    /// Create a new email service.
    #[must_use]
    pub fn new(
        job_repo: EmailJobRepository,
        user_repo: UserRepository,
        templates: Arc<TemplateEngine>,
        provider: Arc<dyn EmailProvider>,
    ) -> Self {
        Self {
            job_repo,
            user_repo,
            templates,
            provider,
            retry: RetryConfig::default(),
            clock: Arc::new(SystemClock),
            stale_claim_timeout: DEFAULT_STALE_CLAIM_TIMEOUT,
            id_gen: IdGenerator::new(),
        }
    }

    /// Set the retry policy.
    pub fn set_retry_config(&mut self, retry: RetryConfig) {
        self.retry = retry;
    }

    /// Set the clock used for job timestamps.
    pub fn set_clock(&mut self, clock: SharedClock) {
        self.clock = clock;
    }

    /// Set how long a job may stay claimed before it is returned to the queue.
    pub fn set_stale_claim_timeout(&mut self, timeout: Duration) {
        self.stale_claim_timeout = timeout;
    }

    /// Descriptors of every template that can be queued.
    #[must_use]
    pub fn available_templates(&self) -> Vec<TemplateDescriptor> {
        self.templates.available_templates()
    }

    // === Producers ===

    /// Queue an email to an internal user. The address is resolved at send time.
    pub async fn send_user_email(&self, input: SendUserEmailInput) -> AppResult<String> {
        input.validate()?;

        self.enqueue(
            Recipient::User(input.recipient_id),
            input.template_type,
            input.template_data,
            input.priority,
            input.scheduled_for,
            input.max_attempts,
        )
        .await
    }

    /// Queue an email to an explicit address.
    pub async fn send_direct_email(&self, input: SendDirectEmailInput) -> AppResult<String> {
        input.validate()?;

        self.enqueue(
            Recipient::Direct {
                email: input.recipient_email,
                name: input.recipient_name.filter(|n| !n.trim().is_empty()),
            },
            input.template_type,
            input.template_data,
            input.priority,
            input.scheduled_for,
            input.max_attempts,
        )
        .await
    }

    async fn enqueue(
        &self,
        recipient: Recipient,
        template_type: String,
        template_data: Value,
        priority: EmailPriority,
        scheduled_for: Option<DateTime<Utc>>,
        max_attempts: Option<u32>,
    ) -> AppResult<String> {
        if !self.templates.contains(&template_type) {
            return Err(TemplateError::NotFound(template_type).into());
        }
        if !matches!(template_data, Value::Object(_) | Value::Null) {
            return Err(AppError::Validation(
                "template_data must be a JSON object".to_string(),
            ));
        }

        let now = self.clock.now();
        let id = self.id_gen.generate();
        let max_attempts = max_attempts.unwrap_or(self.retry.max_attempts).max(1);
        let (user_id, email, name) = match recipient {
            Recipient::User(id) => (Some(id), None, None),
            Recipient::Direct { email, name } => (None, Some(email), name),
        };

        let model = email_job::ActiveModel {
            id: Set(id.clone()),
            recipient_user_id: Set(user_id),
            recipient_email: Set(email),
            recipient_name: Set(name),
            template_type: Set(template_type),
            template_data: Set(if template_data.is_null() {
                json!({})
            } else {
                template_data
            }),
            priority: Set(priority),
            status: Set(EmailStatus::Pending),
            attempts: Set(0),
            max_attempts: Set(max_attempts as i32),
            last_error: Set(None),
            scheduled_for: Set(scheduled_for.unwrap_or(now).into()),
            claimed_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            sent_at: Set(None),
        };

        let job = self.job_repo.create(model).await?;
        tracing::debug!(
            job_id = %job.id,
            template = %job.template_type,
            priority = ?job.priority,
            "Email queued"
        );

        Ok(id)
    }

    // === Operator actions ===

    /// Read one job.
    pub async fn get_email(&self, id: &str) -> AppResult<email_job::Model> {
        self.job_repo.get_by_id(id).await
    }

    /// List jobs, newest first.
    pub async fn list_emails(
        &self,
        status: Option<EmailStatus>,
        limit: u64,
        offset: u64,
    ) -> AppResult<Vec<email_job::Model>> {
        self.job_repo.list(status, limit.clamp(1, 100), offset).await
    }

    /// Cancel a job that has not been claimed yet.
    pub async fn cancel_email(&self, id: &str) -> AppResult<()> {
        if self.job_repo.cancel(id, self.clock.now()).await? {
            tracing::info!(job_id = %id, "Email cancelled");
            return Ok(());
        }

        let job = self.job_repo.get_by_id(id).await?;
        Err(AppError::Conflict(format!(
            "Email job {id} is {} and cannot be cancelled",
            job.status
        )))
    }

    /// Return every `failed` job to `pending` with a fresh attempt budget.
    pub async fn retry_failed(&self) -> AppResult<u64> {
        let count = self.job_repo.reset_failed(self.clock.now()).await?;
        tracing::info!(count, "Failed emails reset for retry");
        Ok(count)
    }

    /// Return abandoned claims to `pending`.
    pub async fn recover_stale_claims(&self) -> AppResult<u64> {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(self.stale_claim_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let recovered = self.job_repo.recover_stale(cutoff, now).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered stale email claims");
        }
        Ok(recovered)
    }

    /// Queue statistics.
    pub async fn get_stats(&self) -> AppResult<QueueStats> {
        let counts = self.job_repo.count_by_status().await?;
        let now = self.clock.now();
        let oldest = self.job_repo.oldest_due_pending_created_at(now).await?;

        let finished = counts.sent + counts.failed;
        let failure_rate = if finished == 0 {
            0.0
        } else {
            counts.failed as f64 / finished as f64
        };

        Ok(QueueStats {
            pending: counts.pending,
            processing: counts.processing,
            sent: counts.sent,
            failed: counts.failed,
            cancelled: counts.cancelled,
            total: counts.total(),
            oldest_pending_age_seconds: oldest.map(|at| (now - at).num_seconds().max(0)),
            failure_rate,
        })
    }

    // === Delivery ===

    /// Claim up to `batch_size` due jobs and try to deliver each of them.
    ///
    /// A failing job never stops the rest of the batch. Only errors from the
    /// sweep or the claim itself are returned.
    pub async fn process_queue(&self, batch_size: u64) -> AppResult<BatchSummary> {
        let recovered = self.recover_stale_claims().await?;
        let jobs = self.job_repo.claim_due(self.clock.now(), batch_size).await?;

        let mut summary = BatchSummary {
            claimed: jobs.len(),
            recovered,
            ..BatchSummary::default()
        };

        for job in &jobs {
            match self.process_job(job).await {
                Ok(Outcome::Sent) => summary.sent += 1,
                Ok(Outcome::Requeued) => summary.requeued += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Ok(Outcome::ClaimLost) => {}
                Err(e) => {
                    // The claim stays in place and is swept after the timeout.
                    tracing::error!(job_id = %job.id, error = %e, "Failed to record email outcome");
                }
            }
        }

        if summary.claimed > 0 {
            tracing::info!(
                claimed = summary.claimed,
                sent = summary.sent,
                requeued = summary.requeued,
                failed = summary.failed,
                "Email batch processed"
            );
        }

        Ok(summary)
    }

    async fn process_job(&self, job: &email_job::Model) -> AppResult<Outcome> {
        if !job.has_attempts_left() {
            let held = self
                .job_repo
                .mark_failed(job, job.attempts, "attempt budget exhausted", self.clock.now())
                .await?;
            return Ok(if held { Outcome::Failed } else { Outcome::ClaimLost });
        }

        let result = self.deliver(job).await;
        let attempts = job.attempts + 1;
        let now = self.clock.now();

        let (held, outcome) = match result {
            Ok(receipt) => {
                tracing::info!(
                    job_id = %job.id,
                    attempts,
                    provider = self.provider.name(),
                    message_id = ?receipt.message_id,
                    "Email sent"
                );
                (self.job_repo.mark_sent(job, now).await?, Outcome::Sent)
            }
            Err(failure)
                if failure.is_retryable()
                    && RetryConfig::should_retry(attempts as u32, job.max_attempts as u32) =>
            {
                let delay = self.retry.delay_for_attempt(attempts as u32);
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                tracing::warn!(
                    job_id = %job.id,
                    attempts,
                    max_attempts = job.max_attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %failure,
                    "Email delivery failed, will retry"
                );
                let held = self
                    .job_repo
                    .reschedule(job, attempts, retry_at, &failure.to_string(), now)
                    .await?;
                (held, Outcome::Requeued)
            }
            Err(failure) => {
                tracing::error!(
                    job_id = %job.id,
                    attempts,
                    retryable = failure.is_retryable(),
                    error = %failure,
                    "Email delivery failed permanently"
                );
                let held = self
                    .job_repo
                    .mark_failed(job, attempts, &failure.to_string(), now)
                    .await?;
                (held, Outcome::Failed)
            }
        };

        if !held {
            tracing::warn!(job_id = %job.id, "Email claim was lost before the outcome was recorded");
            return Ok(Outcome::ClaimLost);
        }
        Ok(outcome)
    }

    async fn deliver(&self, job: &email_job::Model) -> Result<DeliveryReceipt, JobFailure> {
        let (to, to_name) = self.resolve_recipient(job).await?;

        let mut data = match &job.template_data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let display_name = to_name
            .clone()
            .unwrap_or_else(|| to.split('@').next().unwrap_or_default().to_string());
        data.entry("recipient_name")
            .or_insert_with(|| Value::String(display_name));

        let rendered = self
            .templates
            .render(&job.template_type, &Value::Object(data))?;

        let email = OutgoingEmail {
            job_id: job.id.clone(),
            to,
            to_name,
            subject: rendered.subject,
            text: rendered.text,
            html: rendered.html,
        };

        Ok(self.provider.send(&email).await?)
    }

    async fn resolve_recipient(
        &self,
        job: &email_job::Model,
    ) -> Result<(String, Option<String>), JobFailure> {
        let (email, name) = if let Some(address) = &job.recipient_email {
            (address.clone(), job.recipient_name.clone())
        } else if let Some(user_id) = &job.recipient_user_id {
            let user = self
                .user_repo
                .find_by_id(user_id)
                .await
                // Lookups fail like any other transient dependency
                .map_err(|e| JobFailure::Provider(ProviderError::Transient(e.to_string())))?
                .ok_or_else(|| JobFailure::Validation(format!("recipient user {user_id} not found")))?;
            let email = user.email.filter(|e| !e.is_empty()).ok_or_else(|| {
                JobFailure::Validation(format!("recipient user {user_id} has no email address"))
            })?;
            (email, user.name.or(Some(user.username)))
        } else {
            return Err(JobFailure::Validation("job has no recipient".to_string()));
        };

        if !email.validate_email() {
            return Err(JobFailure::Validation(format!(
                "invalid recipient address '{email}'"
            )));
        }
        Ok((email, name))
    }
}
