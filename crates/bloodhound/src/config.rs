//! Service configuration

use anyhow::{Context, Result};
use bloodhound_lib::EngineConfig;
use config::{builder::DefaultState, ConfigBuilder};
use serde::Deserialize;

/// Service configuration, from `bloodhound.*` and `BLOODHOUND_*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct BloodhoundConfig {
    /// Name attached to every structured log line
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Alarm evaluation interval in milliseconds
    #[serde(default = "default_alarm_interval")]
    pub alarm_interval_ms: u64,

    /// Reporting interval in milliseconds; must divide the alarm interval
    #[serde(default = "default_reporting_interval")]
    pub reporting_interval_ms: u64,

    /// Average hits per reporting interval that raise an alarm
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    #[serde(default = "default_top")]
    pub top_keys: usize,

    #[serde(default = "default_top")]
    pub top_details: usize,

    #[serde(default = "default_report_buffer")]
    pub report_buffer: usize,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_alarm_interval() -> u64 {
    120_000
}

fn default_reporting_interval() -> u64 {
    10_000
}

fn default_threshold() -> f64 {
    10.0
}

fn default_top() -> usize {
    10
}

fn default_report_buffer() -> usize {
    16
}

impl BloodhoundConfig {
    /// Load configuration from an optional config file and the environment
    pub fn load() -> Result<Self> {
        Self::from_builder(
            config::Config::builder()
                .add_source(config::File::with_name("bloodhound").required(false))
                .add_source(config::Environment::with_prefix("BLOODHOUND").try_parsing(true)),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Validate intervals and threshold into an engine configuration
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let engine = EngineConfig::from_millis(
            self.alarm_interval_ms,
            self.reporting_interval_ms,
            self.threshold,
        )?
        .with_top_keys(self.top_keys)
        .with_top_details(self.top_details)
        .with_report_buffer(self.report_buffer);

        Ok(engine)
    }
}
