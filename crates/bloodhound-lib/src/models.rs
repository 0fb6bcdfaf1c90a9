//! Core data models for the aggregation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A keyed value as seen by the ranking utilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub key: String,
    pub value: f64,
}

impl RankedEntry {
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Kind of alarm transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmEventKind {
    Triggered,
    Resolved,
}

impl std::fmt::Display for AlarmEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlarmEventKind::Triggered => write!(f, "triggered"),
            AlarmEventKind::Resolved => write!(f, "resolved"),
        }
    }
}

/// A single alarm transition emitted by an alarm cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub kind: AlarmEventKind,
    pub key: String,
    /// Smoothed average that caused the transition (last known value for silent keys)
    pub value: f64,
    pub at: DateTime<Utc>,
    /// Human-readable message for presentation sinks
    pub message: String,
}

impl AlarmEvent {
    pub fn triggered(key: impl Into<String>, value: f64, at: DateTime<Utc>) -> Self {
        let key = key.into();
        let message = format!(
            "High traffic generated an alert for {} - hits = {:.2}, triggered at {}",
            key,
            value,
            at.to_rfc3339()
        );
        Self {
            kind: AlarmEventKind::Triggered,
            key,
            value,
            at,
            message,
        }
    }

    pub fn resolved(key: impl Into<String>, value: f64, at: DateTime<Utc>) -> Self {
        let key = key.into();
        let message = format!(
            "Traffic has returned to normal for site {} at {}",
            key,
            at.to_rfc3339()
        );
        Self {
            kind: AlarmEventKind::Resolved,
            key,
            value,
            at,
            message,
        }
    }
}

/// A key currently in the triggered state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlarm {
    pub key: String,
    pub last_value: f64,
    pub triggered_at: DateTime<Utc>,
}

/// One ranked key in a traffic report, with its ranked details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub key: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub details: Vec<RankedEntry>,
}

/// Raw per-interval ranking produced by every reporting tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficReport {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ReportEntry>,
    /// Number of distinct keys observed in the interval (before the top-K cut)
    pub observed_keys: usize,
}
