//! Queue integration tests.
//!
//! Supervisor behaviour is exercised with scripted processors on tokio's
//! paused clock. The end-to-end cases drive a real `EmailService` over an
//! in-memory database on the normal clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use postbox_common::{AppError, AppResult};
use postbox_core::{
    BatchSummary, DeliveryReceipt, EmailProvider, EmailService, OutgoingEmail, ProviderError,
    SendDirectEmailInput, TemplateEngine,
};
use postbox_db::entities::email_job::{EmailPriority, EmailStatus};
use postbox_db::repositories::{EmailJobRepository, UserRepository};
use postbox_db::test_utils::TestDatabase;
use postbox_queue::{
    LoopConfig, ProcessorSupervisor, QueueProcessor, SupervisorConfig, SupervisorFault,
    SupervisorState,
};

/// Hangs forever on the calls listed in `hang_on`, succeeds otherwise.
struct ScriptedProcessor {
    calls: AtomicUsize,
    hang_on: Vec<usize>,
    retried: AtomicUsize,
}

impl ScriptedProcessor {
    fn new(hang_on: Vec<usize>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            hang_on,
            retried: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueProcessor for ScriptedProcessor {
    async fn process_queue(&self, _batch_size: u64) -> AppResult<BatchSummary> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_on.contains(&call) {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        Ok(BatchSummary {
            claimed: 1,
            sent: 1,
            ..BatchSummary::default()
        })
    }

    async fn retry_failed(&self) -> AppResult<u64> {
        self.retried.fetch_add(1, Ordering::SeqCst);
        Ok(3)
    }
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        loop_config: LoopConfig {
            tick_interval: Duration::from_millis(100),
            batch_size: 10,
            shutdown_grace: Duration::from_millis(500),
        },
        health_check_interval: Duration::from_millis(100),
        stall_threshold: Duration::from_millis(300),
        restart_delay: Duration::from_millis(50),
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop() {
    let processor = ScriptedProcessor::new(vec![]);
    let supervisor = ProcessorSupervisor::new(processor.clone(), fast_config());

    let status = supervisor.get_status().await;
    assert!(!status.running);
    assert_eq!(status.state, SupervisorState::Idle);
    assert!(status.last_heartbeat.is_none());

    assert!(supervisor.start_processor().await);
    assert!(!supervisor.start_processor().await);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let status = supervisor.get_status().await;
    assert!(status.running);
    assert_eq!(status.state, SupervisorState::Running);
    assert!(status.last_heartbeat.is_some());
    assert_eq!(status.uptime_seconds, Some(0));
    assert_eq!(status.restart_count, 0);
    assert_eq!(processor.calls(), 3);

    assert!(supervisor.stop_processor().await);
    assert!(!supervisor.stop_processor().await);
    assert_eq!(supervisor.get_status().await.state, SupervisorState::Idle);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(processor.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_loop_is_restarted() {
    let processor = ScriptedProcessor::new(vec![0]);
    let supervisor = ProcessorSupervisor::new(processor.clone(), fast_config());

    supervisor.start_processor().await;
    tokio::time::sleep(Duration::from_millis(350)).await;

    // The first tick is stuck; nothing else has run.
    assert_eq!(processor.calls(), 1);
    assert_eq!(supervisor.get_status().await.restart_count, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = supervisor.get_status().await;
    assert_eq!(status.restart_count, 1);
    assert_eq!(status.state, SupervisorState::Running);
    assert!(matches!(
        status.last_fault,
        Some(SupervisorFault::Stalled { .. })
    ));
    assert!(processor.calls() >= 2);

    // Healthy again: no further restarts.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(supervisor.get_status().await.restart_count, 1);

    supervisor.stop_processor().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_restart_stays_idle() {
    let processor = ScriptedProcessor::new(vec![0]);
    let mut config = fast_config();
    config.restart_delay = Duration::from_secs(10);
    let supervisor = ProcessorSupervisor::new(processor.clone(), config);

    supervisor.start_processor().await;
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(
        supervisor.get_status().await.state,
        SupervisorState::Restarting
    );

    assert!(supervisor.stop_processor().await);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let status = supervisor.get_status().await;
    assert_eq!(status.state, SupervisorState::Idle);
    assert_eq!(status.restart_count, 0);
    assert_eq!(processor.calls(), 1);
}

/// Each tick takes `work` to finish.
struct SlowProcessor {
    work: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl QueueProcessor for SlowProcessor {
    async fn process_queue(&self, _batch_size: u64) -> AppResult<BatchSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        Ok(BatchSummary::default())
    }

    async fn retry_failed(&self) -> AppResult<u64> {
        Ok(0)
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_answers_while_stop_drains() {
    let processor = Arc::new(SlowProcessor {
        work: Duration::from_secs(20),
        calls: AtomicUsize::new(0),
    });
    let mut config = fast_config();
    config.loop_config.shutdown_grace = Duration::from_secs(30);
    let supervisor = ProcessorSupervisor::new(processor.clone(), config);

    supervisor.start_processor().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let stopper = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.stop_processor().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = tokio::time::timeout(Duration::from_secs(2), supervisor.get_status())
        .await
        .expect("status blocked behind stop");
    assert!(status.running);
    assert_eq!(status.state, SupervisorState::Idle);
    assert!(!stopper.is_finished());

    assert!(stopper.await.unwrap());
    let status = supervisor.get_status().await;
    assert!(!status.running);
    assert_eq!(status.restart_count, 0);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
}

struct PanicOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl QueueProcessor for PanicOnce {
    #[allow(clippy::panic)]
    async fn process_queue(&self, _batch_size: u64) -> AppResult<BatchSummary> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("template registry poisoned");
        }
        Ok(BatchSummary::default())
    }

    async fn retry_failed(&self) -> AppResult<u64> {
        Ok(0)
    }
}

#[tokio::test(start_paused = true)]
async fn test_tick_panic_recorded_without_restart() {
    let processor = Arc::new(PanicOnce {
        calls: AtomicUsize::new(0),
    });
    let supervisor = ProcessorSupervisor::new(processor.clone(), fast_config());

    supervisor.start_processor().await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let status = supervisor.get_status().await;
    assert_eq!(status.last_fault, Some(SupervisorFault::TickPanicked));
    assert_eq!(status.restart_count, 0);
    assert_eq!(status.state, SupervisorState::Running);
    assert!(processor.calls.load(Ordering::SeqCst) >= 2);

    supervisor.stop_processor().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_actions() {
    let processor = ScriptedProcessor::new(vec![]);
    let supervisor = ProcessorSupervisor::new(processor.clone(), fast_config());

    // Manual runs work while idle.
    let summary = supervisor.process_queue_now().await.unwrap();
    assert_eq!(summary.sent, 1);
    assert_eq!(supervisor.retry_failed_emails().await.unwrap(), 3);
    assert_eq!(processor.retried.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.get_status().await.state, SupervisorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_manual_run_panic_becomes_error() {
    let processor = Arc::new(PanicOnce {
        calls: AtomicUsize::new(0),
    });
    let supervisor = ProcessorSupervisor::new(processor, fast_config());

    let err = supervisor.process_queue_now().await.unwrap_err();
    assert!(matches!(err, AppError::Queue(_)));
    assert!(supervisor.process_queue_now().await.is_ok());
}

// === End-to-end with the email service ===

struct Outbox {
    fail: bool,
    sent: AtomicUsize,
}

#[async_trait]
impl EmailProvider for Outbox {
    fn name(&self) -> &'static str {
        "outbox"
    }

    async fn send(&self, _email: &OutgoingEmail) -> Result<DeliveryReceipt, ProviderError> {
        if self.fail {
            return Err(ProviderError::Permanent("rejected".into()));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(DeliveryReceipt::default())
    }
}

async fn email_service(fail: bool) -> (TestDatabase, EmailService, Arc<Outbox>) {
    let db = TestDatabase::in_memory().await.unwrap();
    let outbox = Arc::new(Outbox {
        fail,
        sent: AtomicUsize::new(0),
    });
    let service = EmailService::new(
        EmailJobRepository::new(db.connection()),
        UserRepository::new(db.connection()),
        Arc::new(TemplateEngine::new("Postbox", "https://postbox.example")),
        outbox.clone(),
    );
    (db, service, outbox)
}

fn welcome(to: &str) -> SendDirectEmailInput {
    SendDirectEmailInput {
        recipient_email: to.to_string(),
        recipient_name: None,
        template_type: "welcome".to_string(),
        template_data: serde_json::json!({}),
        priority: EmailPriority::Normal,
        scheduled_for: None,
        max_attempts: None,
    }
}

#[tokio::test]
async fn test_process_now_sends_direct_welcome() {
    let (_db, service, outbox) = email_service(false).await;
    let id = service
        .send_direct_email(welcome("dana@example.com"))
        .await
        .unwrap();

    let supervisor = ProcessorSupervisor::new(Arc::new(service.clone()), fast_config());
    let summary = supervisor.process_queue_now().await.unwrap();
    assert_eq!(summary.sent, 1);
    assert_eq!(outbox.sent.load(Ordering::SeqCst), 1);

    let job = service.get_email(&id).await.unwrap();
    assert_eq!(job.status, EmailStatus::Sent);
    assert!(job.sent_at.is_some());
}

#[tokio::test]
async fn test_retry_failed_emails_resets_jobs() {
    let (_db, service, _outbox) = email_service(true).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            service
                .send_direct_email(welcome(&format!("user{i}@example.com")))
                .await
                .unwrap(),
        );
    }

    let supervisor = ProcessorSupervisor::new(Arc::new(service.clone()), fast_config());
    assert_eq!(supervisor.process_queue_now().await.unwrap().failed, 3);
    assert_eq!(supervisor.retry_failed_emails().await.unwrap(), 3);

    for id in &ids {
        let job = service.get_email(id).await.unwrap();
        assert_eq!(job.status, EmailStatus::Pending);
        assert_eq!(job.attempts, 0);
    }
}

#[tokio::test]
async fn test_running_supervisor_delivers_queued_mail() {
    let (_db, service, outbox) = email_service(false).await;
    let mut config = fast_config();
    config.loop_config.tick_interval = Duration::from_millis(20);
    config.health_check_interval = Duration::from_millis(50);
    config.stall_threshold = Duration::from_secs(5);

    let supervisor = ProcessorSupervisor::new(Arc::new(service.clone()), config);
    supervisor.start_processor().await;

    let id = service
        .send_direct_email(welcome("erin@example.com"))
        .await
        .unwrap();

    let mut delivered = false;
    for _ in 0..100 {
        if service.get_email(&id).await.unwrap().status == EmailStatus::Sent {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    supervisor.stop_processor().await;
    assert!(delivered, "job was not delivered by the running processor");
    assert_eq!(outbox.sent.load(Ordering::SeqCst), 1);
}
