//! Database integration tests.
//!
//! These tests require a running `PostgreSQL` instance.
//! Run with: `cargo test --test db_integration -- --ignored`
//!
//! Environment variables:
//!   `TEST_DB_HOST` (default: localhost)
//!   `TEST_DB_PORT` (default: 5433)
//!   `TEST_DB_USER` (default: `postbox_test`)
//!   `TEST_DB_PASSWORD` (default: `postbox_test`)
//!   `TEST_DB_NAME` (default: `postbox_test`)

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;

use chrono::{Duration, Utc};
use postbox_db::entities::email_job::{self, EmailPriority, EmailStatus};
use postbox_db::repositories::EmailJobRepository;
use postbox_db::test_utils::{TestDatabase, TestDbConfig};
use futures::future::join_all;
use sea_orm::{ConnectionTrait, Set};
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_database_connection() {
    let config = TestDbConfig::default();
    let result = TestDatabase::with_config(config).await;
    assert!(result.is_ok(), "Failed to connect: {:?}", result.err());
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_execute_query() {
    let db = TestDatabase::new().await.expect("Failed to connect");
    let result = db
        .connection()
        .execute(sea_orm::Statement::from_string(
            sea_orm::DatabaseBackend::Postgres,
            "SELECT 1".to_string(),
        ))
        .await;

    assert!(result.is_ok(), "Query failed: {:?}", result.err());
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_skip_locked_claims_are_disjoint() {
    let db = TestDatabase::new().await.expect("Failed to connect");
    db.cleanup().await.unwrap();
    let repo = EmailJobRepository::new(db.connection());
    let now = Utc::now();

    for i in 0..200 {
        repo.create(email_job::ActiveModel {
            id: Set(Uuid::now_v7().to_string()),
            recipient_user_id: Set(None),
            recipient_email: Set(Some("load@example.com".to_string())),
            recipient_name: Set(None),
            template_type: Set("welcome".to_string()),
            template_data: Set(serde_json::json!({})),
            priority: Set(if i % 3 == 0 {
                EmailPriority::High
            } else {
                EmailPriority::Normal
            }),
            status: Set(EmailStatus::Pending),
            attempts: Set(0),
            max_attempts: Set(5),
            last_error: Set(None),
            scheduled_for: Set((now - Duration::seconds(1)).into()),
            claimed_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            sent_at: Set(None),
        })
        .await
        .unwrap();
    }

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = repo.claim_due(Utc::now(), 7).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id));
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for claimed in join_all(workers).await {
        for id in claimed.unwrap() {
            assert!(seen.insert(id.clone()), "{id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 200);

    db.cleanup().await.unwrap();
}

#[test]
fn test_config_from_env() {
    let config = TestDbConfig::default();
    assert!(!config.host.is_empty());
    assert!(config.port > 0);
    assert!(!config.username.is_empty());
}
