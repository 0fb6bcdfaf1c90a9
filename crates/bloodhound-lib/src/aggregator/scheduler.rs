//! Periodic reporting and alarm cycles
//!
//! Runs both cycles from a single tokio task so they never overlap. When the
//! two ticks fall on the same instant the reporting tick runs first, so the
//! interval that just closed is folded into the averages before evaluation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{Aggregator, EngineConfig};
use crate::error::{BloodhoundError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::TrafficReport;
use crate::observability::EngineMetrics;

/// Cancels the scheduler's ticks
///
/// Cloneable and callable from anywhere, including an alarm handler running
/// on the tick being stopped. Stopping more than once is a no-op.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StopHandle {
    fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping aggregation scheduler");
        // No receiver just means the loop never started or already exited
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Drives the reporting and alarm cycles of an [`Aggregator`]
pub struct AggregationScheduler {
    aggregator: Arc<Aggregator>,
    alarm_interval: Duration,
    reporting_interval: Duration,
    report_tx: mpsc::Sender<TrafficReport>,
    health: Option<HealthRegistry>,
    control: StopHandle,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AggregationScheduler {
    /// Create a scheduler; reports arrive on the returned receiver
    pub fn new(
        aggregator: Arc<Aggregator>,
        config: &EngineConfig,
    ) -> (Self, mpsc::Receiver<TrafficReport>) {
        let (report_tx, report_rx) = mpsc::channel(config.report_buffer());

        let scheduler = Self {
            aggregator,
            alarm_interval: config.alarm_interval(),
            reporting_interval: config.reporting_interval(),
            report_tx,
            health: None,
            control: StopHandle::new(),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        };

        (scheduler, report_rx)
    }

    /// Record a heartbeat per completed cycle in `registry`
    pub fn with_health(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Begin both periodic cycles; the first of each fires one period from now
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BloodhoundError::NoRuntime)?;

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BloodhoundError::AlreadyStarted);
        }

        let ticks = TickLoop {
            aggregator: Arc::clone(&self.aggregator),
            alarm_interval: self.alarm_interval,
            reporting_interval: self.reporting_interval,
            report_tx: self.report_tx.clone(),
            health: self.health.clone(),
            stopped: Arc::clone(&self.control.stopped),
            metrics: EngineMetrics::new(),
        };
        let shutdown = self.control.shutdown_tx.subscribe();

        info!(
            alarm_interval_ms = self.alarm_interval.as_millis() as u64,
            reporting_interval_ms = self.reporting_interval.as_millis() as u64,
            "Starting aggregation scheduler"
        );

        *self.task.lock() = Some(runtime.spawn(ticks.run(shutdown)));
        Ok(())
    }

    /// Cancel both cycles; safe to call repeatedly
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.control.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    /// Wait for the tick task to exit after [`AggregationScheduler::stop`]
    pub async fn wait(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Aggregation scheduler task ended abnormally");
            }
        }
    }
}

impl Drop for AggregationScheduler {
    fn drop(&mut self) {
        self.control.stop();
    }
}

struct TickLoop {
    aggregator: Arc<Aggregator>,
    alarm_interval: Duration,
    reporting_interval: Duration,
    report_tx: mpsc::Sender<TrafficReport>,
    health: Option<HealthRegistry>,
    stopped: Arc<AtomicBool>,
    metrics: EngineMetrics,
}

impl TickLoop {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let now = Instant::now();
        let mut report_ticker = interval_at(now + self.reporting_interval, self.reporting_interval);
        let mut alarm_ticker = interval_at(now + self.alarm_interval, self.alarm_interval);
        report_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        alarm_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut report_cycles = 0u64;

        loop {
            if self.is_stopped() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    break;
                }
                _ = report_ticker.tick() => {
                    if self.is_stopped() {
                        break;
                    }
                    self.report_cycle().await;

                    report_cycles += 1;
                    if report_cycles % 60 == 0 {
                        debug!(report_cycles = report_cycles, "Reporting cycles completed");
                    }
                }
                _ = alarm_ticker.tick() => {
                    if self.is_stopped() {
                        break;
                    }
                    self.alarm_cycle().await;
                }
            }
        }

        info!("Aggregation scheduler stopped");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn report_cycle(&self) {
        let report = self.aggregator.report_tick();
        let generated_at = report.generated_at;

        match self.report_tx.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Report channel full, dropping traffic report");
                self.metrics.inc_reports_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Report receiver dropped");
            }
        }

        if let Some(ref health) = self.health {
            health.heartbeat(components::REPORTER, generated_at).await;
        }
    }

    async fn alarm_cycle(&self) {
        let events = self.aggregator.alarm_tick();
        if !events.is_empty() {
            debug!(transitions = events.len(), "Alarm cycle produced transitions");
        }

        if let Some(ref health) = self.health {
            let at = events
                .first()
                .map(|e| e.at)
                .unwrap_or_else(|| self.aggregator.now());
            health.heartbeat(components::ALARM, at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::AlarmEventKind;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn engine(alarm_ms: u64, reporting_ms: u64, threshold: f64) -> (AggregationScheduler, mpsc::Receiver<TrafficReport>) {
        let config = EngineConfig::from_millis(alarm_ms, reporting_ms, threshold).unwrap();
        let aggregator = Arc::new(Aggregator::new(&config).unwrap());
        AggregationScheduler::new(aggregator, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_above_threshold() {
        let (scheduler, _reports) = engine(999, 333, 20.0);
        let mut events = scheduler.aggregator().events();

        scheduler.start().unwrap();
        // window = 3, one interval of 90 hits -> average 30
        scheduler.aggregator().feed("example.com", 90.0);

        sleep(Duration::from_millis(1100)).await;

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, AlarmEventKind::Triggered);
        assert_eq!(event.key, "example.com");
        assert!((event.value - 30.0).abs() < 1e-9);

        scheduler.stop();
        scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_threshold_never_triggers() {
        let (scheduler, _reports) = engine(999, 333, 20.0);
        let mut events = scheduler.aggregator().events();

        scheduler.start().unwrap();
        scheduler.aggregator().feed("example.com", 57.0);

        sleep(Duration::from_millis(1500)).await;
        assert!(events.try_recv().is_err());

        scheduler.stop();
        scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_traffic_triggers_once() {
        let (scheduler, _reports) = engine(300, 100, 20.0);
        let triggered = Arc::new(AtomicUsize::new(0));
        let counter = triggered.clone();
        scheduler
            .aggregator()
            .notifier()
            .subscribe(AlarmEventKind::Triggered, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        scheduler.start().unwrap();
        // Offset feeds so none lands exactly on a tick boundary
        sleep(Duration::from_millis(50)).await;
        for _ in 0..20 {
            scheduler.aggregator().feed("busy", 90.0);
            sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(triggered.load(Ordering::SeqCst), 1);
        assert!(scheduler.aggregator().is_active("busy"));

        scheduler.stop();
        scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_resolves_alarm() {
        let (scheduler, _reports) = engine(300, 100, 20.0);
        let mut events = scheduler.aggregator().events();

        scheduler.start().unwrap();
        scheduler.aggregator().feed("quiet", 90.0);

        sleep(Duration::from_millis(350)).await;
        assert_eq!(events.try_recv().unwrap().kind, AlarmEventKind::Triggered);

        // No feeds at all for the next alarm cycle
        sleep(Duration::from_millis(300)).await;
        let resolved = events.try_recv().unwrap();
        assert_eq!(resolved.kind, AlarmEventKind::Resolved);
        assert_eq!(resolved.key, "quiet");

        scheduler.stop();
        scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_events() {
        let (scheduler, _reports) = engine(300, 100, 20.0);
        let mut events = scheduler.aggregator().events();

        scheduler.start().unwrap();
        scheduler.stop();
        scheduler.stop();
        assert!(scheduler.is_stopped());

        scheduler.aggregator().feed("late", 500.0);
        sleep(Duration::from_millis(1000)).await;

        assert!(events.try_recv().is_err());
        scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_event_handler() {
        let (scheduler, _reports) = engine(300, 100, 20.0);
        let handle = scheduler.stop_handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scheduler
            .aggregator()
            .notifier()
            .subscribe(AlarmEventKind::Triggered, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                handle.stop();
            });

        scheduler.start().unwrap();
        scheduler.aggregator().feed("a", 90.0);
        sleep(Duration::from_millis(350)).await;
        assert!(scheduler.is_stopped());

        // Further traffic and silence produce nothing once stopped
        scheduler.aggregator().feed("b", 90.0);
        sleep(Duration::from_millis(1000)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.aggregator().is_active("a"));
        scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_delivered_each_interval() {
        let (scheduler, mut reports) = engine(300, 100, 1000.0);

        scheduler.start().unwrap();
        scheduler.aggregator().feed("a", 5.0);
        scheduler.aggregator().feed("b", 7.0);
        scheduler.aggregator().feed("a", 4.0);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.observed_keys, 2);
        assert_eq!(report.entries[0].key, "a");
        assert_eq!(report.entries[0].value, 9.0);

        // Next interval starts empty
        let report = reports.recv().await.unwrap();
        assert!(report.entries.is_empty());

        scheduler.stop();
        scheduler.wait().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (scheduler, _reports) = engine(300, 100, 20.0);
        scheduler.start().unwrap();
        assert_eq!(scheduler.start(), Err(BloodhoundError::AlreadyStarted));

        scheduler.stop();
        assert_eq!(scheduler.start(), Err(BloodhoundError::AlreadyStarted));
        scheduler.wait().await;
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (scheduler, _reports) = engine(300, 100, 20.0);
        assert_eq!(scheduler.start(), Err(BloodhoundError::NoRuntime));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_recorded() {
        let registry = HealthRegistry::new();
        registry
            .register(components::REPORTER, Some(Duration::from_millis(100)))
            .await;
        registry
            .register(components::ALARM, Some(Duration::from_millis(300)))
            .await;

        let config = EngineConfig::from_millis(300, 100, 20.0).unwrap();
        let aggregator = Arc::new(Aggregator::new(&config).unwrap());
        let (scheduler, _reports) = AggregationScheduler::new(aggregator, &config);
        let scheduler = scheduler.with_health(registry.clone());

        scheduler.start().unwrap();
        sleep(Duration::from_millis(350)).await;

        let health = registry.health().await;
        assert!(health.components[components::REPORTER].last_heartbeat.is_some());
        assert!(health.components[components::ALARM].last_heartbeat.is_some());

        scheduler.stop();
        scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_use_aggregator_clock() {
        let registry = HealthRegistry::new();
        registry
            .register(components::REPORTER, Some(Duration::from_millis(100)))
            .await;
        registry
            .register(components::ALARM, Some(Duration::from_millis(300)))
            .await;

        let pinned = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let config = EngineConfig::from_millis(300, 100, 20.0).unwrap();
        let aggregator = Arc::new(
            Aggregator::with_clock(&config, Arc::new(ManualClock::new(pinned))).unwrap(),
        );
        let (scheduler, _reports) = AggregationScheduler::new(aggregator, &config);
        let scheduler = scheduler.with_health(registry.clone());

        scheduler.start().unwrap();
        // No traffic, so the alarm cycle emits no events to take a timestamp from
        sleep(Duration::from_millis(350)).await;

        let health = registry.health_at(pinned).await;
        assert_eq!(health.components[components::REPORTER].last_heartbeat, Some(pinned));
        assert_eq!(health.components[components::ALARM].last_heartbeat, Some(pinned));

        scheduler.stop();
        scheduler.wait().await;
    }
}
