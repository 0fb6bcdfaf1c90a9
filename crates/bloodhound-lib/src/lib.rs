//! Traffic aggregation and alarm engine
//!
//! This crate provides the core functionality for:
//! - Per-interval accumulation of keyed observations
//! - Rolling averages and hysteresis threshold alarms
//! - Heap-based top-K ranking of raw traffic
//! - Health checks and observability

pub mod aggregator;
pub mod alarm;
pub mod clock;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod ranking;

pub use aggregator::{AggregationScheduler, Aggregator, EngineConfig, StopHandle};
pub use error::{BloodhoundError, Result};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use ranking::{top_k, to_ranked};
