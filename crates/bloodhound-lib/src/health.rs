//! Health tracking for the engine's periodic cycles
//!
//! Every component records a heartbeat when it completes a cycle. A component
//! that misses two of its periods in a row reports degraded, which is how a
//! stalled scheduler shows up on `/healthz`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Missed periods before a component counts as stalled
const STALL_FACTOR: u32 = 2;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time health of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;
        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const REPORTER: &str = "reporter";
    pub const ALARM: &str = "alarm";
    pub const INPUT: &str = "input";
}

#[derive(Debug, Clone)]
struct ComponentState {
    /// Expected time between heartbeats; `None` for components without a cadence
    period: Option<Duration>,
    last_heartbeat: Option<DateTime<Utc>>,
    failure: Option<String>,
}

impl ComponentState {
    fn health(&self, now: DateTime<Utc>) -> ComponentHealth {
        if let Some(ref failure) = self.failure {
            return ComponentHealth {
                status: ComponentStatus::Unhealthy,
                message: Some(failure.clone()),
                last_heartbeat: self.last_heartbeat,
            };
        }

        let stalled = match (self.period, self.last_heartbeat) {
            (Some(period), Some(last)) => chrono::Duration::from_std(period * STALL_FACTOR)
                .map(|allowed| now.signed_duration_since(last) > allowed)
                .unwrap_or(false),
            _ => false,
        };

        ComponentHealth {
            status: if stalled {
                ComponentStatus::Degraded
            } else {
                ComponentStatus::Healthy
            },
            message: stalled.then(|| "cycle overdue".to_string()),
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Health registry shared between the scheduler and the API
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentState>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component expected to heartbeat every `period`
    pub async fn register(&self, name: &str, period: Option<Duration>) {
        self.components.write().await.insert(
            name.to_string(),
            ComponentState {
                period,
                last_heartbeat: None,
                failure: None,
            },
        );
    }

    /// Record a completed cycle for `name`; clears any recorded failure
    pub async fn heartbeat(&self, name: &str, at: DateTime<Utc>) {
        let mut components = self.components.write().await;
        if let Some(state) = components.get_mut(name) {
            state.last_heartbeat = Some(at);
            state.failure = None;
        }
    }

    /// Mark a component as failed until its next heartbeat
    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        if let Some(state) = components.get_mut(name) {
            state.failure = Some(message.into());
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Health of every component as of `now`
    pub async fn health_at(&self, now: DateTime<Utc>) -> HealthResponse {
        let components: HashMap<String, ComponentHealth> = self
            .components
            .read()
            .await
            .iter()
            .map(|(name, state)| (name.clone(), state.health(now)))
            .collect();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn health(&self) -> HealthResponse {
        self.health_at(Utc::now()).await
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Engine not started".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}
