//! Ticking driver for the email queue.
//!
//! Each tick runs one `process_queue` call on its own task. The loop awaits
//! that task before waiting for the next tick, so ticks never overlap, and a
//! panic inside a tick surfaces as a `JoinError` instead of killing the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use postbox_common::{AppResult, config::ProcessorConfig};
use postbox_core::{BatchSummary, EmailService};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};

/// Work the processor loop drives.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    /// Claim and deliver up to `batch_size` due jobs.
    async fn process_queue(&self, batch_size: u64) -> AppResult<BatchSummary>;

    /// Return failed jobs to the queue.
    async fn retry_failed(&self) -> AppResult<u64>;
}

#[async_trait]
impl QueueProcessor for EmailService {
    async fn process_queue(&self, batch_size: u64) -> AppResult<BatchSummary> {
        Self::process_queue(self, batch_size).await
    }

    async fn retry_failed(&self) -> AppResult<u64> {
        Self::retry_failed(self).await
    }
}

/// Processor loop configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Interval between ticks.
    pub tick_interval: Duration,
    /// Maximum jobs claimed per tick.
    pub batch_size: u64,
    /// How long `stop` waits for an in-flight tick before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            batch_size: 10,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl From<&ProcessorConfig> for LoopConfig {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            tick_interval: config.tick_interval().max(Duration::from_millis(1)),
            batch_size: config.batch_size.max(1),
            ..Self::default()
        }
    }
}

/// Liveness shared between the loop task and its owner.
#[derive(Debug)]
struct Health {
    last_heartbeat: Mutex<Instant>,
    panics: AtomicU64,
    ticks: AtomicU64,
    current_tick: Mutex<Option<AbortHandle>>,
}

impl Health {
    fn new() -> Self {
        Self {
            last_heartbeat: Mutex::new(Instant::now()),
            panics: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            current_tick: Mutex::new(None),
        }
    }

    fn beat(&self) {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_heartbeat(&self) -> Instant {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_current_tick(&self, handle: Option<AbortHandle>) {
        *self
            .current_tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handle;
    }

    fn abort_current_tick(&self) {
        if let Some(handle) = self
            .current_tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    started_at: Instant,
}

/// A loop that has been told to stop and may still be finishing a tick.
pub struct StoppingLoop {
    handle: JoinHandle<()>,
    health: Arc<Health>,
    grace: Duration,
}

impl StoppingLoop {
    /// Wait for the loop task to end, aborting it after the grace period.
    pub async fn finish(self) {
        let mut handle = self.handle;
        if timeout(self.grace, &mut handle).await.is_err() {
            tracing::warn!("Email processor tick did not finish in time, aborting");
            self.health.abort_current_tick();
            handle.abort();
        }

        tracing::info!("Email processor loop stopped");
    }
}

/// Drives [`QueueProcessor::process_queue`] on a fixed interval.
pub struct ProcessorLoop {
    processor: Arc<dyn QueueProcessor>,
    config: LoopConfig,
    health: Arc<Health>,
    running: Option<RunningLoop>,
}

impl ProcessorLoop {
    /// Create a stopped loop.
    #[must_use]
    pub fn new(processor: Arc<dyn QueueProcessor>, config: LoopConfig) -> Self {
        Self {
            processor,
            config,
            health: Arc::new(Health::new()),
            running: None,
        }
    }

    /// Loop configuration.
    #[must_use]
    pub const fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Start ticking. Returns `false` if the loop was already running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        // Heartbeat age is measured from the start until the first tick lands.
        self.health.beat();

        let handle = tokio::spawn(run(
            self.processor.clone(),
            self.config.clone(),
            self.health.clone(),
            stop_rx,
        ));

        self.running = Some(RunningLoop {
            stop_tx,
            handle,
            started_at: Instant::now(),
        });

        tracing::info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Email processor loop started"
        );
        true
    }

    /// Stop ticking and wait for the in-flight tick, if any.
    ///
    /// A tick still running after `shutdown_grace` is aborted. Returns
    /// `false` if the loop was not running.
    pub async fn stop(&mut self) -> bool {
        match self.begin_stop() {
            Some(stopping) => {
                stopping.finish().await;
                true
            }
            None => false,
        }
    }

    /// Signal the loop to stop and hand back the winding-down task.
    ///
    /// No further tick starts once this returns. The caller awaits
    /// [`StoppingLoop::finish`] without holding on to the loop itself.
    pub fn begin_stop(&mut self) -> Option<StoppingLoop> {
        let running = self.running.take()?;
        let _ = running.stop_tx.send(true);

        Some(StoppingLoop {
            handle: running.handle,
            health: self.health.clone(),
            grace: self.config.shutdown_grace,
        })
    }

    /// Tear the loop down immediately, including an in-flight tick.
    pub fn abort(&mut self) {
        if let Some(running) = self.running.take() {
            self.health.abort_current_tick();
            running.handle.abort();
            tracing::warn!("Email processor loop aborted");
        }
    }

    /// Whether the loop was started and its task is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Whether the loop was started but its task has ended on its own.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.handle.is_finished())
    }

    /// Instant of the last tick that completed without panicking.
    #[must_use]
    pub fn last_heartbeat(&self) -> Instant {
        self.health.last_heartbeat()
    }

    /// Time since the last heartbeat.
    #[must_use]
    pub fn heartbeat_age(&self) -> Duration {
        self.health.last_heartbeat().elapsed()
    }

    /// Time since `start`, while running.
    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        self.running
            .as_ref()
            .map(|running| running.started_at.elapsed())
    }

    /// Ticks that completed without panicking, across restarts.
    #[must_use]
    pub fn completed_ticks(&self) -> u64 {
        self.health.ticks.load(Ordering::Relaxed)
    }

    /// Number of panicked ticks since the last call.
    pub fn take_panics(&self) -> u64 {
        self.health.panics.swap(0, Ordering::Relaxed)
    }

    /// Cancel the in-flight tick, which ends the loop task.
    #[cfg(test)]
    pub(crate) fn cancel_current_tick(&self) {
        self.health.abort_current_tick();
    }
}

async fn run(
    processor: Arc<dyn QueueProcessor>,
    config: LoopConfig,
    health: Arc<Health>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            // Also resolves when the owner was dropped.
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        let tick_processor = processor.clone();
        let batch_size = config.batch_size;
        let tick = tokio::spawn(async move { tick_processor.process_queue(batch_size).await });
        health.set_current_tick(Some(tick.abort_handle()));
        let result = tick.await;
        health.set_current_tick(None);

        match result {
            Ok(Ok(summary)) => {
                health.beat();
                health.ticks.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    claimed = summary.claimed,
                    sent = summary.sent,
                    requeued = summary.requeued,
                    failed = summary.failed,
                    recovered = summary.recovered,
                    "Email processor tick finished"
                );
            }
            Ok(Err(e)) => {
                // The tick ran to completion; only the batch failed.
                health.beat();
                health.ticks.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Email processor tick failed");
            }
            Err(e) if e.is_panic() => {
                health.panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Email processor tick panicked");
            }
            Err(_) => break,
        }

        if *stop_rx.borrow() {
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use postbox_common::AppError;
    use std::sync::atomic::AtomicUsize;

    /// Counts calls and tracks how many run at once.
    struct CountingProcessor {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        work: Duration,
        fail: bool,
    }

    impl CountingProcessor {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                work,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl QueueProcessor for CountingProcessor {
        async fn process_queue(&self, _batch_size: u64) -> AppResult<BatchSummary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Database("connection refused".into()));
            }
            Ok(BatchSummary::default())
        }

        async fn retry_failed(&self) -> AppResult<u64> {
            Ok(0)
        }
    }

    fn config(tick_ms: u64) -> LoopConfig {
        LoopConfig {
            tick_interval: Duration::from_millis(tick_ms),
            batch_size: 5,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_from_processor_config() {
        let config = LoopConfig::from(&ProcessorConfig::default());
        assert_eq!(config.tick_interval, Duration::from_secs(10));
        assert_eq!(config.batch_size, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval() {
        let processor = CountingProcessor::new(Duration::ZERO);
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(100));

        assert!(processor_loop.start());
        tokio::time::sleep(Duration::from_millis(350)).await;

        // Immediate first tick, then one per 100ms.
        assert_eq!(processor.calls.load(Ordering::SeqCst), 4);
        assert_eq!(processor_loop.completed_ticks(), 4);
        assert!(processor_loop.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_never_overlap() {
        let processor = CountingProcessor::new(Duration::from_millis(250));
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(100));

        processor_loop.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        processor_loop.stop().await;

        assert_eq!(processor.max_active.load(Ordering::SeqCst), 1);
        assert!(processor.calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let processor = CountingProcessor::new(Duration::ZERO);
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(1_000));

        assert!(processor_loop.start());
        assert!(!processor_loop.start());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert!(processor_loop.is_running());
        processor_loop.stop().await;
        assert!(!processor_loop.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_tick_finish() {
        let processor = CountingProcessor::new(Duration::from_millis(500));
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(100));

        processor_loop.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(processor.active.load(Ordering::SeqCst), 1);

        assert!(processor_loop.stop().await);
        assert_eq!(processor.active.load(Ordering::SeqCst), 0);
        assert_eq!(processor_loop.completed_ticks(), 1);
        assert!(!processor_loop.is_running());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_error_keeps_loop_alive() {
        let processor = Arc::new(CountingProcessor {
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            work: Duration::ZERO,
            fail: true,
        });
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(100));

        processor_loop.start();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert!(processor_loop.is_running());
        assert!(processor_loop.heartbeat_age() < Duration::from_millis(100));
        processor_loop.stop().await;
    }

    struct PanickingProcessor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QueueProcessor for PanickingProcessor {
        #[allow(clippy::panic)]
        async fn process_queue(&self, _batch_size: u64) -> AppResult<BatchSummary> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                panic!("provider exploded");
            }
            Ok(BatchSummary::default())
        }

        async fn retry_failed(&self) -> AppResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_is_contained() {
        let processor = Arc::new(PanickingProcessor {
            calls: AtomicUsize::new(0),
        });
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(100));

        processor_loop.start();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert!(processor_loop.is_running());
        assert_eq!(processor_loop.take_panics(), 1);
        assert_eq!(processor_loop.take_panics(), 0);
        assert_eq!(processor_loop.completed_ticks(), 1);
        processor_loop.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_tick_ends_loop() {
        let processor = CountingProcessor::new(Duration::from_secs(3600));
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(100));

        processor_loop.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        processor_loop.cancel_current_tick();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(processor_loop.has_exited());
        assert!(!processor_loop.is_running());
        // Still owned, so a restart can replace it.
        assert!(processor_loop.uptime().is_some());
        assert!(processor_loop.start());
        processor_loop.abort();
    }

    #[test]
    fn test_loop_config_claims_at_least_one_job() {
        let config = ProcessorConfig {
            batch_size: 0,
            tick_interval_ms: 0,
            ..ProcessorConfig::default()
        };
        let loop_config = LoopConfig::from(&config);
        assert_eq!(loop_config.batch_size, 1);
        assert_eq!(loop_config.tick_interval, Duration::from_millis(1));

        let config = ProcessorConfig {
            batch_size: 25,
            ..ProcessorConfig::default()
        };
        assert_eq!(LoopConfig::from(&config).batch_size, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_stop_returns_before_tick_finishes() {
        let processor = CountingProcessor::new(Duration::from_secs(2));
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(100));

        processor_loop.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopping = processor_loop.begin_stop().unwrap();
        assert!(processor_loop.begin_stop().is_none());
        assert_eq!(processor.active.load(Ordering::SeqCst), 1);

        stopping.finish().await;
        assert_eq!(processor.active.load(Ordering::SeqCst), 0);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_tears_down_stuck_tick() {
        let processor = CountingProcessor::new(Duration::from_secs(3600));
        let mut processor_loop = ProcessorLoop::new(processor.clone(), config(100));

        processor_loop.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(processor.active.load(Ordering::SeqCst), 1);

        processor_loop.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!processor_loop.is_running());
        assert!(processor_loop.uptime().is_none());
    }
}
