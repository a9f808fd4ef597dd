//! Wires the sensor manager to the publisher.
//!
//! The pipeline owns the publisher for the current transport configuration
//! and registers it as the manager's batch handler. Whenever the transport
//! section changes the old publisher is flushed and a fresh one takes over.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::collector::{LifecycleStats, LoopState, SensorManager};
use crate::config::{ConfigError, ConfigUpdate, TransportConfig};
use crate::offline::OfflineBuffer;
use crate::publisher::{Publisher, PublisherConfig, PublisherStats, RedrainOutcome};
use crate::transport::{HttpTransport, Transport, TransportError};

/// Builds the transport for a transport configuration.
pub type TransportFactory =
    Box<dyn Fn(&TransportConfig) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to set up transport: {0}")]
    Transport(#[from] TransportError),
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub sensor_count: usize,
    pub active_sensors: usize,
    pub loop_state: LoopState,
    pub update_frequency: u64,
    pub lifecycle: LifecycleStats,
    pub transport_enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<PublisherStats>,
}

pub struct Pipeline {
    manager: Arc<SensorManager>,
    publisher: RwLock<Option<Arc<Publisher>>>,
    transport_factory: TransportFactory,
}

impl Pipeline {
    /// Pipeline delivering over HTTP.
    pub fn new(manager: Arc<SensorManager>) -> Self {
        Self::with_transport_factory(manager, |config| {
            let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config)?);
            Ok(transport)
        })
    }

    pub fn with_transport_factory<F>(manager: Arc<SensorManager>, factory: F) -> Self
    where
        F: Fn(&TransportConfig) -> Result<Arc<dyn Transport>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            manager,
            publisher: RwLock::new(None),
            transport_factory: Box::new(factory),
        }
    }

    pub fn manager(&self) -> &Arc<SensorManager> {
        &self.manager
    }

    pub async fn publisher(&self) -> Option<Arc<Publisher>> {
        self.publisher.read().await.clone()
    }

    /// Build a publisher for the current transport configuration.
    ///
    /// The previous publisher, if any, is flushed first. With transport
    /// disabled the manager is left without a handler.
    pub async fn configure_publisher(&self) -> Result<(), PipelineError> {
        let transport_config = self.manager.config().transport;
        let transport = self.build_transport(&transport_config)?;
        self.install_publisher(&transport_config, transport).await;
        Ok(())
    }

    fn build_transport(
        &self,
        config: &TransportConfig,
    ) -> Result<Option<Arc<dyn Transport>>, TransportError> {
        if !config.enabled {
            return Ok(None);
        }
        (self.transport_factory)(config).map(Some)
    }

    async fn install_publisher(
        &self,
        transport_config: &TransportConfig,
        transport: Option<Arc<dyn Transport>>,
    ) {
        let mut slot = self.publisher.write().await;

        if let Some(previous) = slot.take() {
            self.manager.clear_handler();
            previous.shutdown().await;
        }

        let Some(transport) = transport else {
            info!("Transport disabled, readings will not be published");
            return;
        };

        let offline = OfflineBuffer::open(&transport_config.offline_buffer_path);
        let publisher = Arc::new(Publisher::new(
            PublisherConfig::from_transport(transport_config),
            transport,
            offline,
        ));

        self.manager.set_handler(publisher.clone());
        *slot = Some(publisher);

        info!(
            url = %transport_config.url,
            topic = %transport_config.topic,
            batch_size = transport_config.batch_size,
            "Publisher initialized"
        );
    }

    /// Apply a configuration update, rebuilding the publisher if the
    /// transport section changed.
    ///
    /// The new transport is built before anything is committed. If either
    /// that or the update itself fails, the configuration and the current
    /// publisher are left as they were.
    pub async fn apply_config_update(&self, update: ConfigUpdate) -> Result<(), PipelineError> {
        let current = self.manager.config().transport;
        let changed = update.transport.clone().filter(|next| *next != current);
        let transport = match &changed {
            Some(next) => Some(self.build_transport(next)?),
            None => None,
        };

        self.manager.update_config(update).await?;

        if let (Some(next), Some(transport)) = (changed, transport) {
            info!("Transport configuration changed, reinitializing publisher");
            self.install_publisher(&next, transport).await;
        }
        Ok(())
    }

    /// Explicitly retry offline-buffered messages. `None` without a publisher.
    pub async fn redrain_offline(&self) -> Option<RedrainOutcome> {
        let publisher = self.publisher().await?;
        Some(publisher.redrain_offline().await)
    }

    pub async fn stats(&self) -> PipelineStats {
        let status = self.manager.all_sensor_status().await;
        let config = self.manager.config();
        let publisher = match self.publisher().await {
            Some(publisher) => Some(publisher.stats().await),
            None => None,
        };

        PipelineStats {
            sensor_count: status.len(),
            active_sensors: status.iter().filter(|s| s.is_active).count(),
            loop_state: self.manager.state(),
            update_frequency: config.update_frequency,
            lifecycle: self.manager.lifecycle(),
            transport_enabled: config.transport.enabled,
            publisher,
        }
    }

    /// Stop collection, close sensors and flush the publisher.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;

        if let Some(publisher) = self.publisher.write().await.take() {
            self.manager.clear_handler();
            publisher.shutdown().await;
            let stats = publisher.stats().await;
            if stats.offline_buffer_size > 0 {
                warn!(
                    offline_buffer_size = stats.offline_buffer_size,
                    "Undelivered messages remain in the offline buffer"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SensorSettings};
    use crate::sensor::SensorRegistry;
    use crate::transport::testing::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn enabled_transport(dir: &tempfile::TempDir, batch_size: usize) -> TransportConfig {
        TransportConfig {
            enabled: true,
            url: "http://sink.local/ingest".to_string(),
            batch_size,
            max_batch_wait_secs: 3600,
            offline_buffer_path: dir.path().join("offline.json"),
            ..TransportConfig::default()
        }
    }

    fn pipeline_with(
        config: Config,
        transport: Arc<MockTransport>,
        builds: Arc<AtomicUsize>,
    ) -> Pipeline {
        let manager = Arc::new(SensorManager::new(config, SensorRegistry::with_builtin(), None));
        Pipeline::with_transport_factory(manager, move |_config| {
            builds.fetch_add(1, Ordering::SeqCst);
            let transport: Arc<dyn Transport> = transport.clone();
            Ok(transport)
        })
    }

    #[tokio::test]
    async fn test_disabled_transport_has_no_publisher() {
        let builds = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline_with(
            Config::default(),
            Arc::new(MockTransport::healthy()),
            builds.clone(),
        );

        pipeline.configure_publisher().await.unwrap();
        assert!(pipeline.publisher().await.is_none());
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        let stats = pipeline.stats().await;
        assert!(!stats.transport_enabled);
        assert!(stats.publisher.is_none());
    }

    #[tokio::test]
    async fn test_end_to_end_tick_reaches_transport() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            transport: enabled_transport(&dir, 1),
            ..Config::default()
        };
        let transport = Arc::new(MockTransport::healthy());
        let pipeline = pipeline_with(config, transport.clone(), Arc::new(AtomicUsize::new(0)));

        pipeline
            .manager()
            .add_sensor("env", "BMP280", SensorSettings::new())
            .await
            .unwrap();
        pipeline.configure_publisher().await.unwrap();
        pipeline.manager().start().await;

        timeout(Duration::from_secs(2), async {
            while transport.delivered_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first reading should be published");
        pipeline.shutdown().await;

        let message = &transport.delivered_json()[0];
        assert_eq!(message["sensor_id"], "env");
        assert_eq!(message["device_id"], "rpi_001");
        assert_eq!(message["customer_id"], "customer_001");
    }

    #[tokio::test]
    async fn test_transport_change_rebuilds_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            transport: enabled_transport(&dir, 10),
            ..Config::default()
        };
        let builds = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(MockTransport::healthy());
        let pipeline = pipeline_with(config, transport.clone(), builds.clone());
        pipeline.configure_publisher().await.unwrap();
        let first = pipeline.publisher().await.unwrap();

        // Unchanged transport section: no rebuild
        pipeline
            .apply_config_update(ConfigUpdate {
                transport: Some(enabled_transport(&dir, 10)),
                ..ConfigUpdate::default()
            })
            .await
            .unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        pipeline
            .apply_config_update(ConfigUpdate {
                transport: Some(enabled_transport(&dir, 5)),
                ..ConfigUpdate::default()
            })
            .await
            .unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);

        let second = pipeline.publisher().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().batch_size, 5);
    }

    #[tokio::test]
    async fn test_rebuild_flushes_old_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            transport: enabled_transport(&dir, 10),
            ..Config::default()
        };
        let transport = Arc::new(MockTransport::healthy());
        let pipeline = pipeline_with(config, transport.clone(), Arc::new(AtomicUsize::new(0)));
        pipeline
            .manager()
            .add_sensor("env", "BMP280", SensorSettings::new())
            .await
            .unwrap();
        pipeline.configure_publisher().await.unwrap();

        let publisher = pipeline.publisher().await.unwrap();
        let readings = pipeline.manager().read_all_sensors().await;
        let device = crate::reading::DeviceMetadata::from_config(&pipeline.manager().config());
        let records = readings
            .into_iter()
            .map(|r| crate::reading::PublishRecord::new(r, device.clone()))
            .collect();
        publisher.publish(records, &Default::default()).await;
        assert_eq!(publisher.stats().await.queue_size, 1);

        pipeline.configure_publisher().await.unwrap();
        assert_eq!(transport.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_redrain_through_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            transport: enabled_transport(&dir, 1),
            ..Config::default()
        };
        let transport = Arc::new(MockTransport::failing());
        let pipeline = pipeline_with(config, transport.clone(), Arc::new(AtomicUsize::new(0)));
        assert!(pipeline.redrain_offline().await.is_none());

        pipeline
            .manager()
            .add_sensor("env", "DHT22", SensorSettings::new())
            .await
            .unwrap();
        pipeline.configure_publisher().await.unwrap();
        pipeline.manager().start().await;
        timeout(Duration::from_secs(2), async {
            loop {
                let stats = pipeline.stats().await;
                if stats.publisher.is_some_and(|p| p.offline_buffer_size > 0) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("failed delivery should land in the offline buffer");
        pipeline.manager().stop().await;

        transport.set_healthy(true);
        let outcome = pipeline.redrain_offline().await.unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.remaining, 0);
    }

    #[tokio::test]
    async fn test_rejected_transport_update_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            transport: enabled_transport(&dir, 10),
            ..Config::default()
        };
        let builds = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline_with(
            config,
            Arc::new(MockTransport::healthy()),
            builds.clone(),
        );
        pipeline.configure_publisher().await.unwrap();
        let before = pipeline.publisher().await.unwrap();

        let err = pipeline
            .apply_config_update(ConfigUpdate {
                location: Some("barn".to_string()),
                transport: Some(TransportConfig {
                    url: String::new(),
                    ..enabled_transport(&dir, 10)
                }),
                ..ConfigUpdate::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let config = pipeline.manager().config();
        assert_eq!(config.transport, enabled_transport(&dir, 10));
        assert_eq!(config.location, "unknown");
        let after = pipeline.publisher().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(pipeline.stats().await.publisher.is_some());
    }

    #[tokio::test]
    async fn test_unbuildable_transport_update_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            transport: enabled_transport(&dir, 10),
            ..Config::default()
        };
        let manager = Arc::new(SensorManager::new(config, SensorRegistry::with_builtin(), None));
        let pipeline = Pipeline::with_transport_factory(manager, |config| {
            if config.topic.is_empty() {
                return Err(TransportError::Config("topic is empty".to_string()));
            }
            let transport: Arc<dyn Transport> = Arc::new(MockTransport::healthy());
            Ok(transport)
        });
        pipeline.configure_publisher().await.unwrap();
        let before = pipeline.publisher().await.unwrap();

        let err = pipeline
            .apply_config_update(ConfigUpdate {
                transport: Some(TransportConfig {
                    topic: String::new(),
                    ..enabled_transport(&dir, 10)
                }),
                ..ConfigUpdate::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));

        assert_eq!(pipeline.manager().config().transport, enabled_transport(&dir, 10));
        let after = pipeline.publisher().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_disabling_transport_drops_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            transport: enabled_transport(&dir, 10),
            ..Config::default()
        };
        let pipeline = pipeline_with(
            config,
            Arc::new(MockTransport::healthy()),
            Arc::new(AtomicUsize::new(0)),
        );
        pipeline.configure_publisher().await.unwrap();

        pipeline
            .apply_config_update(ConfigUpdate {
                transport: Some(TransportConfig {
                    enabled: false,
                    ..enabled_transport(&dir, 10)
                }),
                ..ConfigUpdate::default()
            })
            .await
            .unwrap();
        assert!(pipeline.publisher().await.is_none());
        assert!(!pipeline.stats().await.transport_enabled);
    }

    #[test]
    fn test_http_factory_rejects_empty_url() {
        let manager = Arc::new(SensorManager::new(
            Config::default(),
            SensorRegistry::with_builtin(),
            None,
        ));
        let pipeline = Pipeline::new(manager);
        let result = (pipeline.transport_factory)(&TransportConfig::default());
        assert!(matches!(result, Err(TransportError::Config(_))));
    }
}
