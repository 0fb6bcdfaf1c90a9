//! Bloodhound - traffic aggregation and alarm service
//!
//! Reads observations from stdin, logs a ranked traffic report every
//! reporting interval and raises or resolves alarms on rolling averages.

use bloodhound_lib::{
    health::{components, HealthRegistry},
    observability::{EngineMetrics, StructuredLogger},
    AggregationScheduler, Aggregator, AlarmEventKind,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod input;

const BLOODHOUND_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting bloodhound");

    // Load configuration
    let config = config::BloodhoundConfig::load()?;
    let engine_config = config.engine_config()?;
    info!(
        node_name = %config.node_name,
        window_size = engine_config.window_size(),
        "Engine configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry
        .register(components::REPORTER, Some(engine_config.reporting_interval()))
        .await;
    health_registry
        .register(components::ALARM, Some(engine_config.alarm_interval()))
        .await;
    health_registry.register(components::INPUT, None).await;

    let metrics = EngineMetrics::new();

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(
        BLOODHOUND_VERSION,
        config.alarm_interval_ms,
        config.reporting_interval_ms,
        config.threshold,
    );

    // Alarm transitions go to the structured log
    let aggregator = Arc::new(Aggregator::new(&engine_config)?);
    for kind in [AlarmEventKind::Triggered, AlarmEventKind::Resolved] {
        let logger = logger.clone();
        aggregator
            .notifier()
            .subscribe(kind, move |event| logger.log_alarm(event));
    }

    let (scheduler, mut reports) = AggregationScheduler::new(aggregator.clone(), &engine_config);
    let scheduler = scheduler.with_health(health_registry.clone());
    scheduler.start()?;

    let report_logger = logger.clone();
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            report_logger.log_report(&report);
        }
    });

    let input_aggregator = aggregator.clone();
    let input_health = health_registry.clone();
    let input_handle = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = input::run_reader(stdin, input_aggregator, input_health.clone()).await {
            error!(error = %e, "Input reader failed");
            input_health
                .set_unhealthy(components::INPUT, e.to_string())
                .await;
        }
    });

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        aggregator.clone(),
    ));

    // Mark ready once both cycles are scheduled
    health_registry.set_ready(true).await;

    // Start health and metrics server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Stdin closing does not stop the service; only a signal does
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    health_registry.set_ready(false).await;
    scheduler.stop();
    scheduler.wait().await;

    input_handle.abort();
    api_handle.abort();
    if let Ok(Err(e)) = api_handle.await {
        error!(error = %e, "API server failed");
    }

    Ok(())
}
