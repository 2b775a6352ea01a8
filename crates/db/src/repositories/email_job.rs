//! Email job repository.
//!
//! Every state transition is a single conditional `UPDATE`, so concurrent
//! processors (in this process or another one) coordinate through the table
//! alone. The claim is the only path from `pending` to `processing`.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::entities::{
    EmailJob,
    email_job::{self, EmailPriority, EmailStatus},
};
use chrono::{DateTime, Utc};
use postbox_common::{AppError, AppResult};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, Order,
    QueryFilter, QueryOrder, QuerySelect, QueryTrait,
    prelude::DateTimeWithTimeZone,
    sea_query::{Expr, LockBehavior, LockType, SimpleExpr},
};

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    fn slot(&mut self, status: EmailStatus) -> &mut u64 {
        match status {
            EmailStatus::Pending => &mut self.pending,
            EmailStatus::Processing => &mut self.processing,
            EmailStatus::Sent => &mut self.sent,
            EmailStatus::Failed => &mut self.failed,
            EmailStatus::Cancelled => &mut self.cancelled,
        }
    }

    /// Sum over all statuses.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed + self.cancelled
    }
}

/// Email job repository for database operations.
#[derive(Clone)]
pub struct EmailJobRepository {
    db: Arc<DatabaseConnection>,
}

/// `CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END`
fn priority_rank() -> SimpleExpr {
    Expr::case(
        email_job::Column::Priority.eq(EmailPriority::High),
        EmailPriority::High.rank(),
    )
    .case(
        email_job::Column::Priority.eq(EmailPriority::Normal),
        EmailPriority::Normal.rank(),
    )
    .finally(EmailPriority::Low.rank())
    .into()
}

/// Claim order: priority, then schedule, then creation, then id.
fn claim_order(a: &email_job::Model, b: &email_job::Model) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| a.scheduled_for.cmp(&b.scheduled_for))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Rows still held by the claim that produced `job`.
fn held_by(job: &email_job::Model) -> Condition {
    let condition = Condition::all()
        .add(email_job::Column::Id.eq(job.id.as_str()))
        .add(email_job::Column::Status.eq(EmailStatus::Processing));

    match job.claimed_at {
        Some(claimed_at) => condition.add(email_job::Column::ClaimedAt.eq(claimed_at)),
        None => condition,
    }
}

fn no_claim() -> SimpleExpr {
    Expr::value(Option::<DateTimeWithTimeZone>::None)
}

impl EmailJobRepository {
    /// Create a new email job repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find an email job by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<email_job::Model>> {
        EmailJob::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Get an email job by ID, returning an error if not found.
    pub async fn get_by_id(&self, id: &str) -> AppResult<email_job::Model> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Email job {id} not found")))
    }

    /// List jobs, newest first, optionally restricted to one status.
    pub async fn list(
        &self,
        status: Option<EmailStatus>,
        limit: u64,
        offset: u64,
    ) -> AppResult<Vec<email_job::Model>> {
        let mut query = EmailJob::find();
        if let Some(status) = status {
            query = query.filter(email_job::Column::Status.eq(status));
        }

        query
            .order_by_desc(email_job::Column::CreatedAt)
            .order_by_desc(email_job::Column::Id)
            .limit(limit)
            .offset(offset)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Insert a new email job.
    pub async fn create(&self, model: email_job::ActiveModel) -> AppResult<email_job::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Atomically claim up to `limit` due jobs.
    ///
    /// A single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)
    /// AND status = 'pending' RETURNING *`. Rows another caller claimed first
    /// no longer match `status = 'pending'`, so no id is ever returned twice.
    /// The result is sorted in claim order.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<email_job::Model>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now: DateTimeWithTimeZone = now.into();

        let due = EmailJob::find()
            .select_only()
            .column(email_job::Column::Id)
            .filter(email_job::Column::Status.eq(EmailStatus::Pending))
            .filter(email_job::Column::ScheduledFor.lte(now))
            .order_by(priority_rank(), Order::Asc)
            .order_by_asc(email_job::Column::ScheduledFor)
            .order_by_asc(email_job::Column::CreatedAt)
            .order_by_asc(email_job::Column::Id)
            .limit(limit)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .into_query();

        let mut claimed = EmailJob::update_many()
            .col_expr(
                email_job::Column::Status,
                Expr::value(EmailStatus::Processing),
            )
            .col_expr(email_job::Column::ClaimedAt, Expr::value(now))
            .col_expr(email_job::Column::UpdatedAt, Expr::value(now))
            .filter(email_job::Column::Id.in_subquery(due))
            .filter(email_job::Column::Status.eq(EmailStatus::Pending))
            .exec_with_returning(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        claimed.sort_by(claim_order);
        Ok(claimed)
    }

    /// Return jobs claimed before `cutoff` to `pending`.
    ///
    /// Attempts are left untouched: the worker died before it could record
    /// an outcome. A row is only matched while it is still `processing`, so
    /// each stale claim is recovered once.
    pub async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let cutoff: DateTimeWithTimeZone = cutoff.into();
        let now: DateTimeWithTimeZone = now.into();

        let result = EmailJob::update_many()
            .col_expr(email_job::Column::Status, Expr::value(EmailStatus::Pending))
            .col_expr(email_job::Column::ClaimedAt, no_claim())
            .col_expr(
                email_job::Column::LastError,
                Expr::value("claim expired before an outcome was recorded"),
            )
            .col_expr(email_job::Column::UpdatedAt, Expr::value(now))
            .filter(email_job::Column::Status.eq(EmailStatus::Processing))
            .filter(email_job::Column::ClaimedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected)
    }

    /// Record a successful delivery.
    ///
    /// Returns `false` when the claim was lost (recovered as stale and
    /// possibly claimed again) and nothing was written.
    pub async fn mark_sent(&self, job: &email_job::Model, now: DateTime<Utc>) -> AppResult<bool> {
        let now: DateTimeWithTimeZone = now.into();

        let result = EmailJob::update_many()
            .col_expr(email_job::Column::Status, Expr::value(EmailStatus::Sent))
            .col_expr(email_job::Column::Attempts, Expr::value(job.attempts + 1))
            .col_expr(email_job::Column::SentAt, Expr::value(now))
            .col_expr(email_job::Column::ClaimedAt, no_claim())
            .col_expr(email_job::Column::UpdatedAt, Expr::value(now))
            .filter(held_by(job))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Put a claimed job back in the queue after a retryable failure.
    pub async fn reschedule(
        &self,
        job: &email_job::Model,
        attempts: i32,
        scheduled_for: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let now: DateTimeWithTimeZone = now.into();
        // Never move a job's schedule backwards.
        let scheduled_for: DateTimeWithTimeZone = scheduled_for.into();
        let scheduled_for = scheduled_for.max(job.scheduled_for);

        let result = EmailJob::update_many()
            .col_expr(email_job::Column::Status, Expr::value(EmailStatus::Pending))
            .col_expr(email_job::Column::Attempts, Expr::value(attempts))
            .col_expr(email_job::Column::ScheduledFor, Expr::value(scheduled_for))
            .col_expr(email_job::Column::LastError, Expr::value(error))
            .col_expr(email_job::Column::ClaimedAt, no_claim())
            .col_expr(email_job::Column::UpdatedAt, Expr::value(now))
            .filter(held_by(job))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Finalize a claimed job as `failed`.
    pub async fn mark_failed(
        &self,
        job: &email_job::Model,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let now: DateTimeWithTimeZone = now.into();

        let result = EmailJob::update_many()
            .col_expr(email_job::Column::Status, Expr::value(EmailStatus::Failed))
            .col_expr(email_job::Column::Attempts, Expr::value(attempts))
            .col_expr(email_job::Column::LastError, Expr::value(error))
            .col_expr(email_job::Column::ClaimedAt, no_claim())
            .col_expr(email_job::Column::UpdatedAt, Expr::value(now))
            .filter(held_by(job))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Cancel a job that is still `pending`.
    pub async fn cancel(&self, id: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let now: DateTimeWithTimeZone = now.into();

        let result = EmailJob::update_many()
            .col_expr(
                email_job::Column::Status,
                Expr::value(EmailStatus::Cancelled),
            )
            .col_expr(email_job::Column::UpdatedAt, Expr::value(now))
            .filter(email_job::Column::Id.eq(id))
            .filter(email_job::Column::Status.eq(EmailStatus::Pending))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Reset every `failed` job to `pending` with a fresh attempt budget.
    pub async fn reset_failed(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let now: DateTimeWithTimeZone = now.into();

        let result = EmailJob::update_many()
            .col_expr(email_job::Column::Status, Expr::value(EmailStatus::Pending))
            .col_expr(email_job::Column::Attempts, Expr::value(0))
            .col_expr(email_job::Column::ScheduledFor, Expr::value(now))
            .col_expr(email_job::Column::ClaimedAt, no_claim())
            .col_expr(email_job::Column::UpdatedAt, Expr::value(now))
            .filter(email_job::Column::Status.eq(EmailStatus::Failed))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected)
    }

    /// Count jobs per status in a single grouped query.
    pub async fn count_by_status(&self) -> AppResult<StatusCounts> {
        let rows: Vec<(String, i64)> = EmailJob::find()
            .select_only()
            .column(email_job::Column::Status)
            .column_as(Expr::col(email_job::Column::Id).count(), "count")
            .group_by(email_job::Column::Status)
            .into_tuple()
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match EmailStatus::ALL.into_iter().find(|s| s.as_str() == status) {
                Some(s) => *counts.slot(s) += count.max(0) as u64,
                None => tracing::warn!(status = %status, count, "Unknown email job status"),
            }
        }

        Ok(counts)
    }

    /// Creation time of the oldest pending job that is already due.
    ///
    /// Jobs scheduled for later are not backlog and are left out.
    pub async fn oldest_due_pending_created_at(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let now: DateTimeWithTimeZone = now.into();
        let oldest = EmailJob::find()
            .filter(email_job::Column::Status.eq(EmailStatus::Pending))
            .filter(email_job::Column::ScheduledFor.lte(now))
            .order_by_asc(email_job::Column::CreatedAt)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(oldest.map(|job| job.created_at.with_timezone(&Utc)))
    }
}
