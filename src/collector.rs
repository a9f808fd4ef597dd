//! Sensor manager and background collection loop.
//!
//! The manager owns the sensor set, the live configuration snapshot and the
//! single collection worker. Every control operation (add, remove, update,
//! start, stop) takes the control lock for its whole duration, so they are
//! serialized against each other. The state lock is only held for short
//! bookkeeping and never across a sensor read.
//!
//! Sensor reads are blocking calls into drivers. They run on tokio's
//! blocking pool, each sensor behind its own lock, so a slow sensor never
//! stalls the runtime or the manager's queries.
//!
//! Cancellation is cooperative: `stop` signals the worker over a watch
//! channel. A tick in progress always runs to completion, including the
//! batch handler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{
    validate_thresholds, Config, ConfigError, ConfigStore, ConfigUpdate, SensorDescriptor,
    SensorSettings, ThresholdMap,
};
use crate::reading::{DeviceMetadata, PublishRecord, Reading};
use crate::sensor::{SensorHandle, SensorRegistry, SensorStatus, SensorTypeInfo};

/// How long `stop` waits for the worker before abandoning it.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one collection tick produced.
#[derive(Debug, Clone)]
pub struct TickBatch {
    /// Readings of every active sensor, ok and error, tagged with device metadata
    pub records: Vec<PublishRecord>,

    /// Thresholds from the configuration snapshot of this tick
    pub thresholds: ThresholdMap,
}

/// Consumer of per-tick batches.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: TickBatch);
}

/// Lifecycle of the collection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
}

/// Counts of effective lifecycle transitions. No-op calls are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStats {
    pub starts: u64,
    pub stops: u64,
    pub ticks: u64,
    /// Stops that gave up waiting for the worker
    pub abandoned: u64,
}

#[derive(Default)]
struct LifecycleCounters {
    starts: AtomicU64,
    stops: AtomicU64,
    ticks: AtomicU64,
    abandoned: AtomicU64,
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A sensor shared between the manager and in-flight reads.
type SharedHandle = Arc<tokio::sync::Mutex<SensorHandle>>;

struct ManagerState {
    sensors: BTreeMap<String, SharedHandle>,
    config: Config,
    loop_state: LoopState,
    worker: Option<Worker>,
    handler: Option<Arc<dyn BatchHandler>>,
}

struct Shared {
    state: Mutex<ManagerState>,
    counters: LifecycleCounters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns sensors, configuration and the collection worker.
pub struct SensorManager {
    shared: Arc<Shared>,
    control: tokio::sync::Mutex<()>,
    registry: SensorRegistry,
    store: Option<ConfigStore>,
    stop_timeout: Duration,
}

impl SensorManager {
    /// Create a manager with the given configuration snapshot.
    ///
    /// Sensors listed in `config` are not created until
    /// [`initialize_from_config`](Self::initialize_from_config) is called.
    /// With a `store`, every configuration change is written back to it.
    pub fn new(config: Config, registry: SensorRegistry, store: Option<ConfigStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState {
                    sensors: BTreeMap::new(),
                    config,
                    loop_state: LoopState::Idle,
                    worker: None,
                    handler: None,
                }),
                counters: LifecycleCounters::default(),
            }),
            control: tokio::sync::Mutex::new(()),
            registry,
            store,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Override how long `stop` waits for the worker.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Register the consumer of per-tick batches, replacing any previous one.
    pub fn set_handler(&self, handler: Arc<dyn BatchHandler>) {
        self.shared.lock().handler = Some(handler);
    }

    pub fn clear_handler(&self) {
        self.shared.lock().handler = None;
    }

    /// Copy of the current configuration snapshot.
    pub fn config(&self) -> Config {
        self.shared.lock().config.clone()
    }

    pub fn state(&self) -> LoopState {
        self.shared.lock().loop_state
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn lifecycle(&self) -> LifecycleStats {
        let counters = &self.shared.counters;
        LifecycleStats {
            starts: counters.starts.load(Ordering::SeqCst),
            stops: counters.stops.load(Ordering::SeqCst),
            ticks: counters.ticks.load(Ordering::SeqCst),
            abandoned: counters.abandoned.load(Ordering::SeqCst),
        }
    }

    fn persist(&self, config: &Config) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(config) {
                warn!(path = %store.path().display(), error = %e, "Failed to save configuration");
            }
        }
    }

    /// Create, initialize and register a sensor, recording it in the config.
    pub async fn add_sensor(
        &self,
        sensor_id: &str,
        sensor_type: &str,
        settings: SensorSettings,
    ) -> Result<(), ConfigError> {
        let _control = self.control.lock().await;
        let handle = self.build_sensor(sensor_id, sensor_type, &settings)?;

        let config = {
            let mut state = self.shared.lock();
            if state.sensors.contains_key(sensor_id) {
                return Err(ConfigError::DuplicateSensor(sensor_id.to_string()));
            }

            state.config.sensors.push(SensorDescriptor {
                id: sensor_id.to_string(),
                sensor_type: sensor_type.to_string(),
                config: settings,
                metrics: handle.metrics().to_vec(),
                added_at: Some(Utc::now()),
            });
            state
                .sensors
                .insert(sensor_id.to_string(), Arc::new(tokio::sync::Mutex::new(handle)));
            state.config.clone()
        };
        self.persist(&config);

        info!(sensor_id = %sensor_id, sensor_type = %sensor_type, "Sensor added");
        Ok(())
    }

    fn build_sensor(
        &self,
        sensor_id: &str,
        sensor_type: &str,
        settings: &SensorSettings,
    ) -> Result<SensorHandle, ConfigError> {
        if self.shared.lock().sensors.contains_key(sensor_id) {
            return Err(ConfigError::DuplicateSensor(sensor_id.to_string()));
        }

        let sensor = self
            .registry
            .create(sensor_type, sensor_id, settings)
            .ok_or_else(|| ConfigError::UnknownSensorType(sensor_type.to_string()))?
            .map_err(|e| ConfigError::SensorInitialization {
                id: sensor_id.to_string(),
                reason: e.to_string(),
            })?;

        let mut handle = SensorHandle::new(sensor_id, settings.clone(), sensor);
        if !handle.initialize() {
            return Err(ConfigError::SensorInitialization {
                id: sensor_id.to_string(),
                reason: "hardware initialization failed".to_string(),
            });
        }
        Ok(handle)
    }

    /// Close and unregister a sensor, removing it from the config.
    pub async fn remove_sensor(&self, sensor_id: &str) -> Result<(), ConfigError> {
        let _control = self.control.lock().await;

        let (handle, config) = {
            let mut state = self.shared.lock();
            let handle = state
                .sensors
                .remove(sensor_id)
                .ok_or_else(|| ConfigError::SensorNotFound(sensor_id.to_string()))?;
            state.config.sensors.retain(|s| s.id != sensor_id);
            (handle, state.config.clone())
        };
        // Waits for a read of this sensor that is still in flight
        handle.lock().await.close();
        self.persist(&config);

        info!(sensor_id = %sensor_id, "Sensor removed");
        Ok(())
    }

    /// Re-create every sensor listed in the configuration.
    ///
    /// Sensors that fail to come up are logged and skipped; their entries
    /// stay in the config. Returns the number of sensors created.
    pub async fn initialize_from_config(&self) -> usize {
        let _control = self.control.lock().await;
        let descriptors = self.shared.lock().config.sensors.clone();

        let mut created = 0;
        for descriptor in descriptors {
            info!(
                sensor_id = %descriptor.id,
                sensor_type = %descriptor.sensor_type,
                "Initializing sensor from configuration"
            );
            match self.build_sensor(&descriptor.id, &descriptor.sensor_type, &descriptor.config) {
                Ok(handle) => {
                    self.shared
                        .lock()
                        .sensors
                        .insert(descriptor.id.clone(), Arc::new(tokio::sync::Mutex::new(handle)));
                    created += 1;
                }
                Err(e) => {
                    warn!(sensor_id = %descriptor.id, error = %e, "Failed to initialize sensor");
                }
            }
        }
        created
    }

    /// Apply a partial configuration update.
    ///
    /// If `update_frequency` is part of the update while the loop is running,
    /// the loop is stopped and started again so the new interval takes effect.
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<(), ConfigError> {
        let _control = self.control.lock().await;

        let (config, running) = {
            let mut state = self.shared.lock();
            state.config.apply_update(&update)?;
            (state.config.clone(), state.loop_state == LoopState::Running)
        };
        self.persist(&config);

        if update.update_frequency.is_some() && running {
            info!(
                update_frequency = config.update_frequency,
                "Restarting collection for new update frequency"
            );
            self.stop_locked().await;
            self.start_locked();
        }

        info!("Configuration updated");
        Ok(())
    }

    /// Merge threshold values into the live configuration.
    pub async fn update_thresholds(&self, thresholds: ThresholdMap) -> Result<ThresholdMap, ConfigError> {
        let _control = self.control.lock().await;
        validate_thresholds(&thresholds)?;

        let config = {
            let mut state = self.shared.lock();
            state.config.thresholds.extend(thresholds);
            state.config.clone()
        };
        self.persist(&config);
        Ok(config.thresholds)
    }

    /// Start the collection worker. A no-op if it is already running.
    pub async fn start(&self) {
        let _control = self.control.lock().await;
        self.start_locked();
    }

    fn start_locked(&self) {
        let mut state = self.shared.lock();
        if state.loop_state != LoopState::Idle {
            warn!(state = ?state.loop_state, "Collection already running");
            return;
        }

        let interval = Duration::from_secs(state.config.update_frequency);
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let handle = tokio::spawn(collection_loop(shared, interval, stop_rx));

        state.worker = Some(Worker { stop_tx, handle });
        state.loop_state = LoopState::Running;
        self.shared.counters.starts.fetch_add(1, Ordering::SeqCst);

        info!(interval_secs = interval.as_secs(), "Data collection started");
    }

    /// Stop the collection worker and wait for it, up to the stop timeout.
    ///
    /// A no-op when idle. If the worker does not exit in time it is
    /// abandoned; it still exits after its current tick.
    pub async fn stop(&self) {
        let _control = self.control.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        let worker = {
            let mut state = self.shared.lock();
            if state.loop_state != LoopState::Running {
                return;
            }
            state.loop_state = LoopState::Stopping;
            state.worker.take()
        };

        if let Some(worker) = worker {
            // The receiver may already be gone if the worker panicked
            let _ = worker.stop_tx.send(true);

            match tokio::time::timeout(self.stop_timeout, worker.handle).await {
                Ok(Ok(())) => debug!("Collection worker exited"),
                Ok(Err(e)) => error!(error = %e, "Collection worker panicked"),
                Err(_) => {
                    self.shared.counters.abandoned.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        timeout_secs = self.stop_timeout.as_secs_f64(),
                        "Collection worker did not stop in time, abandoning it"
                    );
                }
            }
        }

        self.shared.lock().loop_state = LoopState::Idle;
        self.shared.counters.stops.fetch_add(1, Ordering::SeqCst);
        info!("Data collection stopped");
    }

    /// Stop collection and close every sensor.
    pub async fn shutdown(&self) {
        info!("Shutting down sensor manager...");
        let _control = self.control.lock().await;
        self.stop_locked().await;

        let handles = self.handles();
        for handle in &handles {
            handle.lock().await.close();
        }
        info!(sensors = handles.len(), "Sensor manager shutdown complete");
    }

    fn handles(&self) -> Vec<SharedHandle> {
        self.shared.lock().sensors.values().cloned().collect()
    }

    pub fn sensor_ids(&self) -> Vec<String> {
        self.shared.lock().sensors.keys().cloned().collect()
    }

    /// Status of one sensor. Waits for an in-flight read of that sensor.
    pub async fn sensor_status(&self, sensor_id: &str) -> Option<SensorStatus> {
        let handle = self.shared.lock().sensors.get(sensor_id).cloned()?;
        let status = handle.lock().await.status();
        Some(status)
    }

    pub async fn all_sensor_status(&self) -> Vec<SensorStatus> {
        let mut statuses = Vec::new();
        for handle in self.handles() {
            statuses.push(handle.lock().await.status());
        }
        statuses
    }

    /// One-shot read of a single active sensor, outside the loop.
    pub async fn read_sensor(&self, sensor_id: &str) -> Option<Reading> {
        let handle = self.shared.lock().sensors.get(sensor_id).cloned()?;
        read_handles(vec![handle]).await.pop()
    }

    /// One-shot read of every active sensor, outside the loop.
    pub async fn read_all_sensors(&self) -> Vec<Reading> {
        read_handles(self.handles()).await
    }

    pub fn available_sensor_types(&self) -> Vec<SensorTypeInfo> {
        self.registry.available()
    }
}

/// Read every active sensor in `handles` on the blocking pool.
async fn read_handles(handles: Vec<SharedHandle>) -> Vec<Reading> {
    if handles.is_empty() {
        return Vec::new();
    }

    let task = tokio::task::spawn_blocking(move || {
        handles
            .iter()
            .filter_map(|handle| {
                let mut handle = handle.blocking_lock();
                handle.is_active().then(|| handle.read())
            })
            .collect::<Vec<_>>()
    });

    match task.await {
        Ok(readings) => readings,
        Err(e) => {
            error!(error = %e, "Sensor read task failed");
            Vec::new()
        }
    }
}

/// Read every active sensor and tag the readings.
///
/// Device metadata and thresholds come from the configuration snapshot taken
/// once the reads are done.
async fn collect_tick(shared: &Shared) -> Option<(TickBatch, Arc<dyn BatchHandler>)> {
    let handles: Vec<SharedHandle> = shared.lock().sensors.values().cloned().collect();
    let readings = read_handles(handles).await;

    let state = shared.lock();
    let handler = state.handler.clone()?;
    if readings.is_empty() {
        return None;
    }

    let device = DeviceMetadata::from_config(&state.config);
    let records = readings
        .into_iter()
        .map(|reading| PublishRecord::new(reading, device.clone()))
        .collect();

    Some((
        TickBatch {
            records,
            thresholds: state.config.thresholds.clone(),
        },
        handler,
    ))
}

async fn collection_loop(shared: Arc<Shared>, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
    debug!(interval_secs = interval.as_secs(), "Collection worker started");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        if let Some((batch, handler)) = collect_tick(&shared).await {
            let errors = batch
                .records
                .iter()
                .filter(|r| !r.reading.is_ok())
                .count();
            debug!(
                readings = batch.records.len(),
                errors = errors,
                "Collection tick complete"
            );
            handler.handle(batch).await;
        }
        shared.counters.ticks.fetch_add(1, Ordering::SeqCst);

        // Interval runs from the end of this tick's work
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Collection worker exiting");
}
