//! Create email job queue table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EmailJob::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EmailJob::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EmailJob::RecipientUserId).string_len(64).null())
                    .col(ColumnDef::new(EmailJob::RecipientEmail).string_len(320).null())
                    .col(ColumnDef::new(EmailJob::RecipientName).string_len(256).null())
                    .col(
                        ColumnDef::new(EmailJob::TemplateType)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(ColumnDef::new(EmailJob::TemplateData).json_binary().not_null())
                    .col(
                        ColumnDef::new(EmailJob::Priority)
                            .string_len(8)
                            .not_null()
                            .default("normal"),
                    )
                    .col(
                        ColumnDef::new(EmailJob::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(EmailJob::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EmailJob::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(5),
                    )
                    .col(ColumnDef::new(EmailJob::LastError).text().null())
                    .col(
                        ColumnDef::new(EmailJob::ScheduledFor)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailJob::ClaimedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(EmailJob::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailJob::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailJob::SentAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim scan: status = pending AND scheduled_for <= now
        manager
            .create_index(
                Index::create()
                    .name("idx_email_job_status_scheduled_for")
                    .table(EmailJob::Table)
                    .col(EmailJob::Status)
                    .col(EmailJob::ScheduledFor)
                    .to_owned(),
            )
            .await?;

        // Stale claim sweep: status = processing AND claimed_at < cutoff
        manager
            .create_index(
                Index::create()
                    .name("idx_email_job_status_claimed_at")
                    .table(EmailJob::Table)
                    .col(EmailJob::Status)
                    .col(EmailJob::ClaimedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_job_recipient_user_id")
                    .table(EmailJob::Table)
                    .col(EmailJob::RecipientUserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EmailJob::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum EmailJob {
    Table,
    Id,
    RecipientUserId,
    RecipientEmail,
    RecipientName,
    TemplateType,
    TemplateData,
    Priority,
    Status,
    Attempts,
    MaxAttempts,
    LastError,
    ScheduledFor,
    ClaimedAt,
    CreatedAt,
    UpdatedAt,
    SentAt,
}
