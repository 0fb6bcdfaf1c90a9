//! Hysteresis alarm evaluation
//!
//! Each alarm cycle hands the state machine a snapshot of the smoothed averages
//! for keys observed during that cycle. Only transitions produce events:
//! - `Normal -> Triggered` when the average reaches the threshold (`>=`)
//! - `Triggered -> Normal` when it drops below, or when the key went silent
//!   for the whole cycle and is missing from the snapshot

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{BloodhoundError, Result};
use crate::models::{ActiveAlarm, AlarmEvent, RankedEntry};
use crate::ranking::to_ranked;

/// Tracks which keys are currently in the triggered state
#[derive(Debug, Clone)]
pub struct AlarmStateMachine {
    threshold: f64,
    /// Ordered by key so silent-key expiry resolves in a stable order
    active: BTreeMap<String, ActiveAlarm>,
}

impl AlarmStateMachine {
    pub fn new(threshold: f64) -> Result<Self> {
        if !threshold.is_finite() {
            return Err(BloodhoundError::invalid(format!(
                "threshold must be finite, got {}",
                threshold
            )));
        }

        Ok(Self {
            threshold,
            active: BTreeMap::new(),
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains_key(key)
    }

    pub fn has_active_alarms(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn number_of_active(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> impl Iterator<Item = &ActiveAlarm> {
        self.active.values()
    }

    /// Run one alarm cycle against `snapshot` and return the emitted events
    ///
    /// Events come out in descending-average order, followed by silent-key
    /// resolutions in key order. Non-finite averages count as missing.
    pub fn evaluate(&mut self, snapshot: HashMap<String, f64>, now: DateTime<Utc>) -> Vec<AlarmEvent> {
        let reported: HashSet<String> = snapshot
            .iter()
            .filter(|(_, value)| value.is_finite())
            .map(|(key, _)| key.clone())
            .collect();

        let mut ranked = to_ranked(snapshot);
        let mut events = Vec::new();
        let mut scanned = 0usize;

        while let Some(entry) = ranked.pop_max() {
            scanned += 1;
            let below = entry.value < self.threshold;

            if below && !self.has_active_alarms() {
                // Ranked order: nothing left can reach the threshold
                break;
            }

            let currently_active = self.is_active(&entry.key);
            if below && currently_active {
                events.push(self.resolve(entry, now));
            } else if !below && !currently_active {
                events.push(self.trigger(entry, now));
            } else if let Some(alarm) = self.active.get_mut(&entry.key) {
                alarm.last_value = entry.value;
            }
        }

        debug!(
            scanned = scanned,
            skipped = ranked.len(),
            active = self.number_of_active(),
            "Alarm cycle ranking drained"
        );

        let silent: Vec<String> = self
            .active
            .keys()
            .filter(|key| !reported.contains(*key))
            .cloned()
            .collect();

        for key in silent {
            if let Some(alarm) = self.active.get(&key) {
                let entry = RankedEntry::new(key.clone(), alarm.last_value);
                events.push(self.resolve(entry, now));
            }
        }

        events
    }

    fn trigger(&mut self, entry: RankedEntry, now: DateTime<Utc>) -> AlarmEvent {
        let event = AlarmEvent::triggered(entry.key.clone(), entry.value, now);
        self.active.insert(
            entry.key.clone(),
            ActiveAlarm {
                key: entry.key,
                last_value: entry.value,
                triggered_at: now,
            },
        );
        event
    }

    fn resolve(&mut self, entry: RankedEntry, now: DateTime<Utc>) -> AlarmEvent {
        self.active.remove(&entry.key);
        AlarmEvent::resolved(entry.key, entry.value, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlarmEventKind;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn snapshot(values: &[(&str, f64)]) -> HashMap<String, f64> {
        values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_initial_state_has_no_alarms() {
        let machine = AlarmStateMachine::new(20.0).unwrap();
        assert!(!machine.has_active_alarms());
        assert_eq!(machine.number_of_active(), 0);
    }

    #[test]
    fn test_non_finite_threshold_rejected() {
        assert!(AlarmStateMachine::new(f64::NAN).is_err());
        assert!(AlarmStateMachine::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_below_threshold_does_not_trigger() {
        let mut machine = AlarmStateMachine::new(20.0).unwrap();
        let events = machine.evaluate(snapshot(&[("a", 19.0), ("b", 1.0)]), at(0));
        assert!(events.is_empty());
        assert!(!machine.has_active_alarms());
    }

    #[test]
    fn test_equality_triggers() {
        let mut machine = AlarmStateMachine::new(20.0).unwrap();
        let events = machine.evaluate(snapshot(&[("a", 20.0)]), at(0));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlarmEventKind::Triggered);
        assert_eq!(events[0].key, "a");
        assert_eq!(events[0].at, at(0));

        // Staying exactly on the threshold never resolves
        let events = machine.evaluate(snapshot(&[("a", 20.0)]), at(1));
        assert!(events.is_empty());
        assert!(machine.is_active("a"));
    }

    #[test]
    fn test_hysteresis_single_trigger_and_resolve() {
        let mut machine = AlarmStateMachine::new(20.0).unwrap();
        let series = [5.0, 25.0, 30.0, 28.0, 21.0, 12.0, 3.0];
        let mut triggered = 0;
        let mut resolved = 0;

        for (minute, value) in series.iter().enumerate() {
            for event in machine.evaluate(snapshot(&[("a", *value)]), at(minute as u32)) {
                match event.kind {
                    AlarmEventKind::Triggered => triggered += 1,
                    AlarmEventKind::Resolved => resolved += 1,
                }
            }
        }

        assert_eq!(triggered, 1);
        assert_eq!(resolved, 1);
        assert!(!machine.has_active_alarms());
    }

    #[test]
    fn test_silent_key_resolves() {
        let mut machine = AlarmStateMachine::new(20.0).unwrap();
        machine.evaluate(snapshot(&[("a", 40.0)]), at(0));
        assert!(machine.is_active("a"));

        let events = machine.evaluate(HashMap::new(), at(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlarmEventKind::Resolved);
        assert_eq!(events[0].key, "a");
        // Silent keys resolve with their last known value
        assert_eq!(events[0].value, 40.0);
        assert!(!machine.has_active_alarms());
    }

    #[test]
    fn test_silent_key_resolves_while_others_stay_active() {
        let mut machine = AlarmStateMachine::new(10.0).unwrap();
        machine.evaluate(snapshot(&[("a", 50.0), ("b", 40.0)]), at(0));
        assert_eq!(machine.number_of_active(), 2);

        let events = machine.evaluate(snapshot(&[("b", 45.0)]), at(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "a");
        assert_eq!(events[0].kind, AlarmEventKind::Resolved);
        assert!(machine.is_active("b"));
        assert_eq!(machine.number_of_active(), 1);
    }

    #[test]
    fn test_events_follow_descending_rank() {
        let mut machine = AlarmStateMachine::new(10.0).unwrap();
        let events = machine.evaluate(
            snapshot(&[("low", 11.0), ("high", 90.0), ("mid", 50.0), ("quiet", 2.0)]),
            at(0),
        );

        let keys: Vec<&str> = events.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["high", "mid", "low"]);
        assert_eq!(machine.number_of_active(), 3);
    }

    #[test]
    fn test_resolution_below_threshold_with_other_active() {
        let mut machine = AlarmStateMachine::new(10.0).unwrap();
        machine.evaluate(snapshot(&[("a", 50.0), ("b", 40.0)]), at(0));

        let events = machine.evaluate(snapshot(&[("a", 60.0), ("b", 1.0), ("c", 2.0)]), at(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "b");
        assert_eq!(events[0].kind, AlarmEventKind::Resolved);
        assert!(machine.is_active("a"));
        assert!(!machine.is_active("c"));
    }

    #[test]
    fn test_non_finite_average_treated_as_silent() {
        let mut machine = AlarmStateMachine::new(10.0).unwrap();
        machine.evaluate(snapshot(&[("a", 50.0)]), at(0));

        let events = machine.evaluate(snapshot(&[("a", f64::NAN)]), at(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlarmEventKind::Resolved);
        assert_eq!(events[0].value, 50.0);
    }

    #[test]
    fn test_active_value_refreshed_while_sustained() {
        let mut machine = AlarmStateMachine::new(10.0).unwrap();
        machine.evaluate(snapshot(&[("a", 50.0)]), at(0));
        machine.evaluate(snapshot(&[("a", 70.0)]), at(1));

        let alarm = machine.active().next().unwrap();
        assert_eq!(alarm.last_value, 70.0);
        assert_eq!(alarm.triggered_at, at(0));
    }
}
