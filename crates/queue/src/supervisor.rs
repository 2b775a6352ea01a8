//! Lifecycle owner for the processor loop.
//!
//! The supervisor starts and stops the loop on request, runs a health check
//! beside it, and restarts the loop when its heartbeat goes stale or its
//! task ends while it should be running. Faults are logged and recorded in
//! the status; they never reach callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use postbox_common::{AppError, AppResult, config::ProcessorConfig};
use postbox_core::BatchSummary;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::processor::{LoopConfig, ProcessorLoop, QueueProcessor};

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Idle,
    Running,
    Restarting,
}

/// Something the supervisor detected and recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SupervisorFault {
    /// A tick panicked; the loop itself kept running.
    #[error("processor tick panicked")]
    TickPanicked,

    /// No tick completed within the stall threshold.
    #[error("processor stalled: no heartbeat for {silent_secs}s")]
    Stalled { silent_secs: u64 },

    /// The loop task ended while it should have been running.
    #[error("processor loop exited unexpectedly")]
    LoopExited,
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub loop_config: LoopConfig,
    /// Interval between health checks; never shorter than the tick interval.
    pub health_check_interval: Duration,
    /// Heartbeat age after which the loop counts as stalled.
    pub stall_threshold: Duration,
    /// Pause between tearing a faulty loop down and starting a new one.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&ProcessorConfig::default())
    }
}

impl From<&ProcessorConfig> for SupervisorConfig {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            loop_config: LoopConfig::from(config),
            health_check_interval: config.health_check_interval(),
            stall_threshold: config.stall_threshold(),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Snapshot returned by [`ProcessorSupervisor::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStatus {
    pub running: bool,
    pub state: SupervisorState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<u64>,
    pub restart_count: u64,
    pub last_fault: Option<SupervisorFault>,
    pub tick_interval_ms: u64,
    pub batch_size: u64,
}

struct Controlled {
    state: SupervisorState,
    /// A stopped loop is still finishing its last tick.
    draining: bool,
    processor_loop: ProcessorLoop,
    monitor: Option<Monitor>,
    last_fault: Option<SupervisorFault>,
    /// Set when the supervisor was started, kept across restarts.
    started_at: Option<Instant>,
}

struct Monitor {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    processor: Arc<dyn QueueProcessor>,
    config: SupervisorConfig,
    /// Serializes start and stop. Held across a stop's drain so a new loop
    /// never overlaps the old one; status reads only take `controlled`.
    lifecycle: Mutex<()>,
    controlled: Mutex<Controlled>,
    restart_count: AtomicU64,
}

/// Owns the single processor loop and keeps it alive.
#[derive(Clone)]
pub struct ProcessorSupervisor {
    inner: Arc<Inner>,
}

impl ProcessorSupervisor {
    /// Create an idle supervisor.
    #[must_use]
    pub fn new(processor: Arc<dyn QueueProcessor>, config: SupervisorConfig) -> Self {
        let mut config = config;
        config.health_check_interval = config
            .health_check_interval
            .max(config.loop_config.tick_interval);

        let processor_loop = ProcessorLoop::new(processor.clone(), config.loop_config.clone());

        Self {
            inner: Arc::new(Inner {
                processor,
                config,
                lifecycle: Mutex::new(()),
                controlled: Mutex::new(Controlled {
                    state: SupervisorState::Idle,
                    draining: false,
                    processor_loop,
                    monitor: None,
                    last_fault: None,
                    started_at: None,
                }),
                restart_count: AtomicU64::new(0),
            }),
        }
    }

    /// Start the loop and the health check. Returns `false` if already running.
    pub async fn start_processor(&self) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let mut controlled = self.inner.controlled.lock().await;
        if controlled.state != SupervisorState::Idle {
            return false;
        }

        controlled.processor_loop.start();
        controlled.monitor = Some(self.spawn_monitor());
        controlled.state = SupervisorState::Running;
        controlled.started_at = Some(Instant::now());

        tracing::info!("Email processor supervisor started");
        true
    }

    /// Stop the health check and the loop. Returns `false` if already idle.
    ///
    /// Waits for the in-flight tick, up to the loop's shutdown grace. Status
    /// stays readable meanwhile and reports `running` until the tick is done.
    pub async fn stop_processor(&self) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let (monitor, stopping) = {
            let mut controlled = self.inner.controlled.lock().await;
            if controlled.state == SupervisorState::Idle {
                return false;
            }
            controlled.state = SupervisorState::Idle;
            controlled.started_at = None;
            let stopping = controlled.processor_loop.begin_stop();
            controlled.draining = stopping.is_some();
            (controlled.monitor.take(), stopping)
        };

        if let Some(monitor) = monitor {
            let _ = monitor.stop_tx.send(true);
            monitor.handle.abort();
        }
        if let Some(stopping) = stopping {
            stopping.finish().await;
        }
        self.inner.controlled.lock().await.draining = false;

        tracing::info!("Email processor supervisor stopped");
        true
    }

    /// Current status.
    pub async fn get_status(&self) -> ProcessorStatus {
        let controlled = self.inner.controlled.lock().await;
        let loop_config = controlled.processor_loop.config();
        let running = controlled.state != SupervisorState::Idle || controlled.draining;

        let last_heartbeat = running.then(|| {
            let age = controlled.processor_loop.heartbeat_age();
            chrono::Duration::from_std(age)
                .ok()
                .and_then(|age| Utc::now().checked_sub_signed(age))
                .unwrap_or_else(Utc::now)
        });

        ProcessorStatus {
            running,
            state: controlled.state,
            last_heartbeat,
            uptime_seconds: controlled.started_at.map(|at| at.elapsed().as_secs()),
            restart_count: self.inner.restart_count.load(Ordering::Relaxed),
            last_fault: controlled.last_fault.clone(),
            tick_interval_ms: loop_config.tick_interval.as_millis() as u64,
            batch_size: loop_config.batch_size,
        }
    }

    /// Run one batch right away, outside the loop's schedule.
    ///
    /// The atomic claim keeps this safe alongside a running loop.
    pub async fn process_queue_now(&self) -> AppResult<BatchSummary> {
        let processor = self.inner.processor.clone();
        let batch_size = self.inner.config.loop_config.batch_size;

        tokio::spawn(async move { processor.process_queue(batch_size).await })
            .await
            .map_err(|e| AppError::Queue(format!("manual processing run failed: {e}")))?
    }

    /// Return every failed job to the queue.
    pub async fn retry_failed_emails(&self) -> AppResult<u64> {
        self.inner.processor.retry_failed().await
    }

    fn spawn_monitor(&self) -> Monitor {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let period = inner.config.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut checks = interval_at(Instant::now() + period, period);
            checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = checks.tick() => {}
                }
                inner.check_health().await;
            }
        });

        Monitor { stop_tx, handle }
    }
}

impl Inner {
    async fn check_health(&self) {
        let mut controlled = self.controlled.lock().await;
        if controlled.state != SupervisorState::Running {
            return;
        }

        let panics = controlled.processor_loop.take_panics();
        if panics > 0 {
            tracing::warn!(panics, "Email processor ticks panicked since last check");
            controlled.last_fault = Some(SupervisorFault::TickPanicked);
        }

        let age = controlled.processor_loop.heartbeat_age();
        let fault = if controlled.processor_loop.has_exited() {
            SupervisorFault::LoopExited
        } else if age > self.config.stall_threshold {
            SupervisorFault::Stalled {
                silent_secs: age.as_secs(),
            }
        } else {
            return;
        };

        tracing::warn!(fault = %fault, "Restarting email processor loop");
        controlled.processor_loop.abort();
        controlled.state = SupervisorState::Restarting;
        controlled.last_fault = Some(fault);
        drop(controlled);

        tokio::time::sleep(self.config.restart_delay).await;

        let mut controlled = self.controlled.lock().await;
        // Stopped while we were waiting
        if controlled.state != SupervisorState::Restarting {
            return;
        }
        controlled.processor_loop.start();
        controlled.state = SupervisorState::Running;
        let restarts = self.restart_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(restart_count = restarts, "Email processor loop restarted");
    }
}
