//! Observability infrastructure for the aggregation engine
//!
//! Provides:
//! - Prometheus metrics (feed volume, tracked keys, alarm transitions, cycle latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{AlarmEvent, AlarmEventKind, TrafficReport};

/// Histogram buckets for cycle latency (in seconds)
const CYCLE_LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    observations_accepted: IntCounter,
    observations_rejected: IntCounter,
    tracked_keys: IntGauge,
    active_alarms: IntGauge,
    alarm_transitions: IntCounterVec,
    cycle_latency_seconds: HistogramVec,
    reports_dropped: IntCounter,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            observations_accepted: register_int_counter!(
                "bloodhound_observations_accepted_total",
                "Observations folded into the per-interval accumulator"
            )
            .expect("Failed to register observations_accepted"),

            observations_rejected: register_int_counter!(
                "bloodhound_observations_rejected_total",
                "Observations rejected because their value was not finite"
            )
            .expect("Failed to register observations_rejected"),

            tracked_keys: register_int_gauge!(
                "bloodhound_tracked_keys",
                "Number of keys with a rolling average entry"
            )
            .expect("Failed to register tracked_keys"),

            active_alarms: register_int_gauge!(
                "bloodhound_active_alarms",
                "Number of keys currently in the triggered state"
            )
            .expect("Failed to register active_alarms"),

            alarm_transitions: register_int_counter_vec!(
                "bloodhound_alarm_transitions_total",
                "Alarm state transitions by kind",
                &["kind"]
            )
            .expect("Failed to register alarm_transitions"),

            cycle_latency_seconds: register_histogram_vec!(
                "bloodhound_cycle_latency_seconds",
                "Time spent inside a reporting or alarm cycle",
                &["cycle"],
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            reports_dropped: register_int_counter!(
                "bloodhound_reports_dropped_total",
                "Traffic reports dropped because the report channel was full"
            )
            .expect("Failed to register reports_dropped"),
        }
    }
}

/// Cycle label values for latency metrics
pub mod cycles {
    pub const REPORT: &str = "report";
    pub const ALARM: &str = "alarm";
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Create a metrics handle (registers global metrics on first call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn inc_observations_accepted(&self) {
        self.inner().observations_accepted.inc();
    }

    pub fn inc_observations_rejected(&self) {
        self.inner().observations_rejected.inc();
    }

    pub fn set_tracked_keys(&self, count: usize) {
        self.inner().tracked_keys.set(count as i64);
    }

    pub fn set_active_alarms(&self, count: usize) {
        self.inner().active_alarms.set(count as i64);
    }

    /// Count the transitions in one alarm cycle
    pub fn record_transitions(&self, events: &[AlarmEvent]) {
        for event in events {
            let kind = event.kind.to_string();
            self.inner()
                .alarm_transitions
                .with_label_values(&[kind.as_str()])
                .inc();
        }
    }

    pub fn observe_cycle_latency(&self, cycle: &str, duration_secs: f64) {
        self.inner()
            .cycle_latency_seconds
            .with_label_values(&[cycle])
            .observe(duration_secs);
    }

    pub fn inc_reports_dropped(&self) {
        self.inner().reports_dropped.inc();
    }
}

/// Structured logger for engine events
///
/// Keeps the field names of alarm and report logs consistent across the
/// library and the service binary.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log an alarm transition
    pub fn log_alarm(&self, event: &AlarmEvent) {
        match event.kind {
            AlarmEventKind::Triggered => {
                warn!(
                    event = "alarm_triggered",
                    node = %self.node_name,
                    key = %event.key,
                    value = event.value,
                    at = %event.at.to_rfc3339(),
                    "{}",
                    event.message
                );
            }
            AlarmEventKind::Resolved => {
                info!(
                    event = "alarm_resolved",
                    node = %self.node_name,
                    key = %event.key,
                    value = event.value,
                    at = %event.at.to_rfc3339(),
                    "{}",
                    event.message
                );
            }
        }
    }

    /// Log a ranked traffic report
    pub fn log_report(&self, report: &TrafficReport) {
        let top = serde_json::to_string(&report.entries).unwrap_or_default();
        info!(
            event = "traffic_report",
            node = %self.node_name,
            generated_at = %report.generated_at.to_rfc3339(),
            observed_keys = report.observed_keys,
            top = %top,
            "Traffic report"
        );
    }

    pub fn log_startup(&self, version: &str, alarm_interval_ms: u64, reporting_interval_ms: u64, threshold: f64) {
        info!(
            event = "engine_started",
            node = %self.node_name,
            version = %version,
            alarm_interval_ms = alarm_interval_ms,
            reporting_interval_ms = reporting_interval_ms,
            threshold = threshold,
            "Bloodhound started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Bloodhound shutting down"
        );
    }
}
