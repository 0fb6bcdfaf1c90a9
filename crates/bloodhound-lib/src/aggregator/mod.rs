//! Shared aggregation state and the two engine cycles
//!
//! [`Aggregator`] is the single lock domain of the engine. It owns the raw
//! per-interval accumulator, the rolling averages, the alarm-cycle snapshot and
//! the alarm state, and exposes the two cycles as plain methods:
//! - [`Aggregator::report_tick`] swaps out the raw counts, folds them into the
//!   rolling averages and ranks them for presentation
//! - [`Aggregator::alarm_tick`] swaps out the averages observed during the
//!   alarm cycle and runs hysteresis evaluation over them
//!
//! [`AggregationScheduler`] drives both cycles on tokio intervals.

mod scheduler;


pub use scheduler::{AggregationScheduler, StopHandle};

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::alarm::{AlarmNotifier, AlarmStateMachine, RollingAverages};
use crate::clock::{Clock, SystemClock};
use crate::error::{BloodhoundError, Result};
use crate::models::{ActiveAlarm, AlarmEvent, ReportEntry, TrafficReport};
use crate::observability::{cycles, EngineMetrics};
use crate::ranking::top_k;

/// Default number of keys in a traffic report
pub const DEFAULT_TOP_KEYS: usize = 10;

/// Default number of details ranked under each reported key
pub const DEFAULT_TOP_DETAILS: usize = 10;

/// Default capacity of the report channel
pub const DEFAULT_REPORT_BUFFER: usize = 16;

/// Validated engine configuration
///
/// The alarm interval must be a positive multiple of the reporting interval;
/// their ratio is the rolling-average window.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    alarm_interval: Duration,
    reporting_interval: Duration,
    threshold: f64,
    window_size: u32,
    top_keys: usize,
    top_details: usize,
    report_buffer: usize,
}

impl EngineConfig {
    pub fn new(alarm_interval: Duration, reporting_interval: Duration, threshold: f64) -> Result<Self> {
        if reporting_interval.is_zero() {
            return Err(BloodhoundError::invalid("reporting interval must be positive"));
        }
        if alarm_interval.is_zero() {
            return Err(BloodhoundError::invalid("alarm interval must be positive"));
        }
        if alarm_interval.as_nanos() % reporting_interval.as_nanos() != 0 {
            return Err(BloodhoundError::invalid(format!(
                "alarm interval ({:?}) must be a multiple of the reporting interval ({:?})",
                alarm_interval, reporting_interval
            )));
        }
        if !threshold.is_finite() {
            return Err(BloodhoundError::invalid(format!(
                "threshold must be finite, got {}",
                threshold
            )));
        }

        let window_size = u32::try_from(alarm_interval.as_nanos() / reporting_interval.as_nanos())
            .map_err(|_| BloodhoundError::invalid("alarm window spans too many reporting intervals"))?;

        Ok(Self {
            alarm_interval,
            reporting_interval,
            threshold,
            window_size,
            top_keys: DEFAULT_TOP_KEYS,
            top_details: DEFAULT_TOP_DETAILS,
            report_buffer: DEFAULT_REPORT_BUFFER,
        })
    }

    /// Shorthand for [`EngineConfig::new`] with millisecond intervals
    pub fn from_millis(alarm_interval_ms: u64, reporting_interval_ms: u64, threshold: f64) -> Result<Self> {
        Self::new(
            Duration::from_millis(alarm_interval_ms),
            Duration::from_millis(reporting_interval_ms),
            threshold,
        )
    }

    /// Number of keys kept in each traffic report
    pub fn with_top_keys(mut self, top_keys: usize) -> Self {
        self.top_keys = top_keys;
        self
    }

    /// Number of details ranked under each reported key
    pub fn with_top_details(mut self, top_details: usize) -> Self {
        self.top_details = top_details;
        self
    }

    /// Capacity of the report channel (at least one)
    pub fn with_report_buffer(mut self, report_buffer: usize) -> Self {
        self.report_buffer = report_buffer.max(1);
        self
    }

    pub fn alarm_interval(&self) -> Duration {
        self.alarm_interval
    }

    pub fn reporting_interval(&self) -> Duration {
        self.reporting_interval
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn top_keys(&self) -> usize {
        self.top_keys
    }

    pub fn top_details(&self) -> usize {
        self.top_details
    }

    pub fn report_buffer(&self) -> usize {
        self.report_buffer
    }
}

/// Raw count for one key in the current reporting interval
#[derive(Debug, Default)]
struct KeyTally {
    value: f64,
    details: HashMap<String, f64>,
}

struct AggregateState {
    pending: HashMap<String, KeyTally>,
    averages: RollingAverages,
    /// Latest averages of keys observed since the last alarm cycle
    cycle: HashMap<String, f64>,
    alarms: AlarmStateMachine,
}

/// Owner of all mutable engine state
pub struct Aggregator {
    state: Mutex<AggregateState>,
    notifier: AlarmNotifier,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
    top_keys: usize,
    top_details: usize,
}

impl Aggregator {
    /// Create an aggregator that timestamps events with the system clock
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(AggregateState {
                pending: HashMap::new(),
                averages: RollingAverages::new(config.window_size())?,
                cycle: HashMap::new(),
                alarms: AlarmStateMachine::new(config.threshold())?,
            }),
            notifier: AlarmNotifier::new(),
            clock,
            metrics: EngineMetrics::new(),
            top_keys: config.top_keys(),
            top_details: config.top_details(),
        })
    }

    /// Add `value` to `key`'s count for the current reporting interval
    ///
    /// Returns false (and records nothing) when `value` is not finite.
    pub fn feed(&self, key: &str, value: f64) -> bool {
        if !self.accept(key, value) {
            return false;
        }

        let mut state = self.state.lock();
        state.pending.entry(key.to_string()).or_default().value += value;
        true
    }

    /// Like [`Aggregator::feed`], also counting `value` under `detail` within `key`
    pub fn feed_detail(&self, key: &str, detail: &str, value: f64) -> bool {
        if !self.accept(key, value) {
            return false;
        }

        let mut state = self.state.lock();
        let tally = state.pending.entry(key.to_string()).or_default();
        tally.value += value;
        *tally.details.entry(detail.to_string()).or_insert(0.0) += value;
        true
    }

    fn accept(&self, key: &str, value: f64) -> bool {
        if value.is_finite() {
            self.metrics.inc_observations_accepted();
            true
        } else {
            debug!(key = %key, value = value, "Rejecting non-finite observation");
            self.metrics.inc_observations_rejected();
            false
        }
    }

    /// Current smoothed average for `key`, `None` if it was never reported
    pub fn average(&self, key: &str) -> Option<f64> {
        self.state.lock().averages.get(key)
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.state.lock().alarms.is_active(key)
    }

    pub fn has_active_alarms(&self) -> bool {
        self.state.lock().alarms.has_active_alarms()
    }

    /// Currently triggered keys, ordered by key
    pub fn active_alarms(&self) -> Vec<ActiveAlarm> {
        self.state.lock().alarms.active().cloned().collect()
    }

    /// Current time of the aggregator's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn notifier(&self) -> &AlarmNotifier {
        &self.notifier
    }

    /// Receiver for every alarm event published from now on
    pub fn events(&self) -> broadcast::Receiver<AlarmEvent> {
        self.notifier.events()
    }

    /// Close the reporting interval: fold raw counts into the averages and rank them
    pub fn report_tick(&self) -> TrafficReport {
        let started = Instant::now();
        let generated_at = self.clock.now();

        let pending = {
            let mut state = self.state.lock();
            let mut pending = mem::take(&mut state.pending);

            // Finite feeds can still sum past f64::MAX; such a key counts as unreported
            pending.retain(|key, tally| {
                if tally.value.is_finite() {
                    true
                } else {
                    warn!(key = %key, "Interval total overflowed, dropping key from cycle");
                    false
                }
            });

            let AggregateState {
                averages, cycle, ..
            } = &mut *state;
            for (key, tally) in &pending {
                if let Some(average) = averages.update(key, tally.value) {
                    cycle.insert(key.clone(), average);
                }
            }

            self.metrics.set_tracked_keys(averages.len());
            pending
        };

        let entries = top_k(
            pending.iter().map(|(key, tally)| (key.as_str(), tally.value)),
            self.top_keys,
        )
        .into_iter()
        .map(|entry| {
            let details = pending
                .get(&entry.key)
                .map(|tally| {
                    top_k(
                        tally.details.iter().map(|(detail, value)| (detail.as_str(), *value)),
                        self.top_details,
                    )
                })
                .unwrap_or_default();

            ReportEntry {
                key: entry.key,
                value: entry.value,
                details,
            }
        })
        .collect();

        self.metrics
            .observe_cycle_latency(cycles::REPORT, started.elapsed().as_secs_f64());

        TrafficReport {
            generated_at,
            entries,
            observed_keys: pending.len(),
        }
    }

    /// Close the alarm cycle: evaluate thresholds and publish any transitions
    ///
    /// Events are published after the state lock is released, in the order
    /// they are returned.
    pub fn alarm_tick(&self) -> Vec<AlarmEvent> {
        let started = Instant::now();
        let now = self.clock.now();

        let events = {
            let mut state = self.state.lock();
            let snapshot = mem::take(&mut state.cycle);
            let reported = snapshot.len();
            let events = state.alarms.evaluate(snapshot, now);

            debug!(
                reported_keys = reported,
                transitions = events.len(),
                active = state.alarms.number_of_active(),
                "Alarm cycle evaluated"
            );
            self.metrics.set_active_alarms(state.alarms.number_of_active());
            events
        };

        self.metrics.record_transitions(&events);
        self.metrics
            .observe_cycle_latency(cycles::ALARM, started.elapsed().as_secs_f64());

        self.notifier.publish(&events);
        events
    }
}
