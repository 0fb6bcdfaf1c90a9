//! Threshold alarms over smoothed per-key averages
//!
//! This module provides:
//! - Rolling averages per key (single-sample moving average over a window)
//! - Hysteresis evaluation with silent-key expiry
//! - Event delivery to registered handlers and channel receivers

mod notifier;
mod rolling;
mod state;

pub use notifier::{AlarmNotifier, SubscriptionId};
pub use rolling::RollingAverages;
pub use state::AlarmStateMachine;
