//! Email job entity.
//!
//! One row per queued email. Column names and the status vocabulary are the
//! durable contract shared with ops tooling; change them only together with
//! a migration.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an email job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    /// Waiting to be claimed once `scheduled_for` has passed.
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Claimed by a worker.
    #[sea_orm(string_value = "processing")]
    Processing,
    /// Accepted by the provider.
    #[sea_orm(string_value = "sent")]
    Sent,
    /// Gave up; terminal for the automatic processor.
    #[sea_orm(string_value = "failed")]
    Failed,
    /// Cancelled by an operator before it was sent.
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl EmailStatus {
    /// All statuses, in reporting order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Sent,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Wire/database name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Higher priorities are claimed first.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
#[serde(rename_all = "lowercase")]
pub enum EmailPriority {
    #[sea_orm(string_value = "high")]
    High,
    #[default]
    #[sea_orm(string_value = "normal")]
    Normal,
    #[sea_orm(string_value = "low")]
    Low,
}

impl EmailPriority {
    /// Claim order rank; lower is claimed first.
    #[must_use]
    pub const fn rank(self) -> i32 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// A queued email.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_job")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Internal user resolved to an address at send time.
    #[sea_orm(nullable, indexed)]
    pub recipient_user_id: Option<String>,

    /// Direct recipient address.
    #[sea_orm(nullable)]
    pub recipient_email: Option<String>,

    /// Direct recipient display name.
    #[sea_orm(nullable)]
    pub recipient_name: Option<String>,

    /// Template key understood by the template engine.
    pub template_type: String,

    /// Template payload.
    #[sea_orm(column_type = "JsonBinary")]
    pub template_data: Json,

    pub priority: EmailPriority,

    pub status: EmailStatus,

    #[sea_orm(default_value = 0)]
    pub attempts: i32,

    #[sea_orm(default_value = 5)]
    pub max_attempts: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Not claimable before this instant.
    pub scheduled_for: DateTimeWithTimeZone,

    /// Set by the claim, cleared when the job leaves `processing`.
    #[sea_orm(nullable)]
    pub claimed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    /// Set if and only if `status == sent`.
    #[sea_orm(nullable)]
    pub sent_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether the automatic processor may still retry this job.
    #[must_use]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
