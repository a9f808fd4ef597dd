//! Edge Telemetry - sensor collection agent for edge devices
//!
//! This service reads the configured sensors on a fixed interval, drops
//! readings that did not change meaningfully, and batch-publishes the rest
//! to a remote sink. Messages that cannot be delivered are kept in an
//! offline buffer on disk.
//!
//! ## Features
//!
//! - Periodic collection on a tokio background task
//! - Threshold downsampling per sensor
//! - Size-based and time-based batch flushing
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! Configuration is read from a JSON file and may be overridden by
//! environment variables. Overridden values are never written back to the
//! file:
//!
//! - `EDGE_TELEMETRY_CONFIG`: Configuration file path (default: config.json)
//! - `EDGE_TELEMETRY_DEVICE_ID`: Device identifier
//! - `EDGE_TELEMETRY_UPDATE_FREQUENCY_SECS`: Seconds between collection ticks
//! - `EDGE_TELEMETRY_TRANSPORT_URL`: Sink URL
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_telemetry::collector::SensorManager;
use edge_telemetry::config::{Config, ConfigStore, EnvOverrides};
use edge_telemetry::pipeline::Pipeline;
use edge_telemetry::sensor::SensorRegistry;

/// Upper bound on the whole shutdown sequence
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Edge Telemetry agent...");

    let overrides = match EnvOverrides::from_env() {
        Ok(overrides) => overrides,
        Err(e) => {
            error!(error = %e, "Invalid environment override");
            std::process::exit(1);
        }
    };
    let store = ConfigStore::from_env().with_overrides(overrides);
    let config = match load_config(&store) {
        Ok(config) => {
            info!(
                path = %store.path().display(),
                device_id = %config.device_id,
                update_frequency = config.update_frequency,
                sensors = config.sensors.len(),
                transport_enabled = config.transport.enabled,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let manager = Arc::new(SensorManager::new(
        config,
        SensorRegistry::with_builtin(),
        Some(store),
    ));
    let created = manager.initialize_from_config().await;
    info!(sensors = created, "Sensors initialized");

    // A broken transport section disables publishing but not collection
    let pipeline = Pipeline::new(manager.clone());
    if let Err(e) = pipeline.configure_publisher().await {
        error!(error = %e, "Failed to initialize publisher, continuing without publishing");
    }

    manager.start().await;

    // Wait for shutdown signal
    info!("Edge Telemetry running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, pipeline.shutdown()).await {
        Ok(()) => {
            let stats = pipeline.stats().await;
            info!(
                ticks = stats.lifecycle.ticks,
                published = stats.publisher.as_ref().map_or(0, |p| p.publish_count),
                "Pipeline shut down gracefully"
            );
        }
        Err(_) => {
            warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        }
    }

    info!("Edge Telemetry stopped");
}

/// Load the persisted configuration with the store's overrides applied.
fn load_config(store: &ConfigStore) -> Result<Config, edge_telemetry::ConfigError> {
    let config = store.load_or_default();
    config.validate()?;
    Ok(config)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
