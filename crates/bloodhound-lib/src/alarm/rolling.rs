//! Rolling average tracking
//!
//! Keeps one smoothed value per key using the single-sample recurrence
//! `avg' = avg - avg/N + value/N`. No sample history is stored, so a spike
//! immediately moves the average by `spike/N` and a constant input converges
//! toward that constant over roughly `N` updates.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{BloodhoundError, Result};

/// Smoothed averages for every key ever observed
#[derive(Debug, Clone)]
pub struct RollingAverages {
    window_size: u32,
    averages: HashMap<String, f64>,
}

impl RollingAverages {
    /// Create a tracker for a window of `window_size` samples; zero is rejected
    pub fn new(window_size: u32) -> Result<Self> {
        if window_size == 0 {
            return Err(BloodhoundError::invalid("window size must be greater than zero"));
        }

        Ok(Self {
            window_size,
            averages: HashMap::new(),
        })
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Fold `value` into the average for `key` and return the new average
    ///
    /// Non-finite values leave the average untouched; the returned value is
    /// then the current average, or `None` for a key that has never been seen.
    pub fn update(&mut self, key: &str, value: f64) -> Option<f64> {
        if !value.is_finite() {
            debug!(key = %key, value = value, "Ignoring non-finite value for rolling average");
            return self.get(key);
        }

        let window = f64::from(self.window_size);
        let average = self.averages.entry(key.to_string()).or_insert(0.0);
        *average = next_average(*average, value, window);
        Some(*average)
    }

    /// Current smoothed value, or `None` if the key was never observed
    pub fn get(&self, key: &str) -> Option<f64> {
        self.averages.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.averages.contains_key(key)
    }

    /// Number of keys with an average entry
    pub fn len(&self) -> usize {
        self.averages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.averages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.averages.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

fn next_average(average: f64, value: f64, window: f64) -> f64 {
    average - average / window + value / window
}
