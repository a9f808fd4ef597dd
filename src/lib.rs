//! Edge Telemetry Library
//!
//! This library provides the components of an edge sensor telemetry agent:
//!
//! - **config**: Persisted JSON configuration with environment overrides
//! - **reading**: Sensor readings and the published message format
//! - **sensor**: Sensor abstraction, type registry and simulated drivers
//! - **collector**: Sensor manager and the periodic collection loop
//! - **filter**: Per-sensor threshold downsampling
//! - **offline**: Durable buffer for undeliverable messages
//! - **transport**: Single-attempt message delivery to the sink
//! - **publisher**: Filtering, batching and offline fallback
//! - **pipeline**: Wiring the manager to the publisher
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use edge_telemetry::collector::SensorManager;
//! use edge_telemetry::config::ConfigStore;
//! use edge_telemetry::pipeline::Pipeline;
//! use edge_telemetry::sensor::SensorRegistry;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load persisted configuration, writing defaults on first run
//!     let store = ConfigStore::from_env();
//!     let config = store.load_or_default();
//!
//!     // Create the manager and bring up configured sensors
//!     let manager = Arc::new(SensorManager::new(
//!         config,
//!         SensorRegistry::with_builtin(),
//!         Some(store),
//!     ));
//!     manager.initialize_from_config().await;
//!
//!     // Attach a publisher if transport is enabled, then collect
//!     let pipeline = Pipeline::new(manager.clone());
//!     pipeline.configure_publisher().await.ok();
//!     manager.start().await;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     pipeline.shutdown().await;
//! }
//! ```

// Module declarations
pub mod collector;
pub mod config;
pub mod filter;
pub mod offline;
pub mod pipeline;
pub mod publisher;
pub mod reading;
pub mod sensor;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use collector::{BatchHandler, LifecycleStats, LoopState, SensorManager, TickBatch};
pub use config::{Config, ConfigError, ConfigStore, ConfigUpdate, EnvOverrides, TransportConfig};
pub use filter::DownsampleFilter;
pub use offline::{OfflineBuffer, OfflineBufferError};
pub use pipeline::{Pipeline, PipelineError, PipelineStats};
pub use publisher::{Publisher, PublisherConfig, PublisherStats};
pub use reading::{DeviceMetadata, PublishRecord, Reading, ReadingStatus};
pub use sensor::{Sensor, SensorError, SensorRegistry, SensorStatus};
pub use transport::{HttpTransport, Transport, TransportError};
