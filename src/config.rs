//! Configuration module for the edge telemetry pipeline.
//!
//! The configuration is a JSON document holding device identity, the polling
//! cadence, the persisted sensor list, transport settings and the
//! downsampling thresholds. A few settings can be overridden from the
//! environment.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Default location of the configuration document
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Default location of the offline buffer file
pub const DEFAULT_OFFLINE_BUFFER_PATH: &str = "offline_buffer.json";

/// Default polling interval in seconds
const DEFAULT_UPDATE_FREQUENCY_SECS: u64 = 60;

/// Default number of messages per published batch
const DEFAULT_BATCH_SIZE: usize = 10;

/// Default time before a short batch is flushed on the next enqueue
const DEFAULT_MAX_BATCH_WAIT_SECS: u64 = 5;

/// Default per-request timeout for the HTTP transport
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Maximum allowed batch size to prevent memory issues
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Configuration map handed to a sensor constructor.
pub type SensorSettings = serde_json::Map<String, serde_json::Value>;

/// Metric name to minimum absolute change required to publish.
pub type ThresholdMap = BTreeMap<String, f64>;

/// Error type for configuration loading, validation and sensor management.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error for {var}: {message}")]
    Env { var: String, message: String },

    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Sensor '{0}' already exists")]
    DuplicateSensor(String),

    #[error("Sensor '{0}' not found")]
    SensorNotFound(String),

    #[error("Unknown sensor type: {0}")]
    UnknownSensorType(String),

    #[error("Sensor '{id}' failed to initialize: {reason}")]
    SensorInitialization { id: String, reason: String },
}

/// A sensor entry as persisted in the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// Unique sensor identifier
    pub id: String,

    /// Registered sensor type tag, e.g. `BMP280`
    #[serde(rename = "type")]
    pub sensor_type: String,

    /// Type-specific settings
    #[serde(default)]
    pub config: SensorSettings,

    /// Metric names this sensor can produce
    #[serde(default)]
    pub metrics: Vec<String>,

    /// When the sensor was added
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
}

/// Transport settings for the remote telemetry sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Whether readings are published at all
    pub enabled: bool,

    /// Endpoint receiving one JSON message per request
    pub url: String,

    /// Topic name forwarded to the sink
    pub topic: String,

    /// Optional bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    pub request_timeout_secs: u64,

    /// Number of queued messages that triggers a flush
    pub batch_size: usize,

    /// Seconds after the last batch at which the next enqueue flushes
    pub max_batch_wait_secs: u64,

    /// File holding messages that failed delivery
    pub offline_buffer_path: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            topic: "sensor-data-raw".to_string(),
            auth_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_wait_secs: DEFAULT_MAX_BATCH_WAIT_SECS,
            offline_buffer_path: PathBuf::from(DEFAULT_OFFLINE_BUFFER_PATH),
        }
    }
}

/// Device configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: String,
    pub customer_id: String,
    pub location: String,

    /// Seconds between the end of one collection tick and the next
    pub update_frequency: u64,

    pub sensors: Vec<SensorDescriptor>,
    pub transport: TransportConfig,
    pub thresholds: ThresholdMap,
}

impl Default for Config {
    fn default() -> Self {
        let thresholds = [
            ("temperature", 0.5),
            ("pressure", 2.0),
            ("humidity", 2.0),
            ("altitude", 5.0),
        ]
        .into_iter()
        .map(|(metric, value)| (metric.to_string(), value))
        .collect();

        Self {
            device_id: "rpi_001".to_string(),
            customer_id: "customer_001".to_string(),
            location: "unknown".to_string(),
            update_frequency: DEFAULT_UPDATE_FREQUENCY_SECS,
            sensors: Vec::new(),
            transport: TransportConfig::default(),
            thresholds,
        }
    }
}

impl Config {
    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("device_id must not be empty".to_string()));
        }

        if self.update_frequency == 0 {
            return Err(ConfigError::Invalid(
                "update_frequency must be greater than 0".to_string(),
            ));
        }

        validate_thresholds(&self.thresholds)?;

        if self.transport.enabled && self.transport.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "transport is enabled but has no URL".to_string(),
            ));
        }

        let batch_size = self.transport.batch_size;
        if batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "batch size {} exceeds maximum allowed ({})",
                batch_size, MAX_BATCH_SIZE
            )));
        }

        Ok(())
    }

    /// Apply a partial update, leaving absent fields untouched.
    ///
    /// The result is validated before it replaces `self`.
    pub fn apply_update(&mut self, update: &ConfigUpdate) -> Result<(), ConfigError> {
        let mut next = self.clone();

        if let Some(device_id) = &update.device_id {
            next.device_id = device_id.clone();
        }
        if let Some(customer_id) = &update.customer_id {
            next.customer_id = customer_id.clone();
        }
        if let Some(location) = &update.location {
            next.location = location.clone();
        }
        if let Some(frequency) = update.update_frequency {
            next.update_frequency = frequency;
        }
        if let Some(transport) = &update.transport {
            next.transport = transport.clone();
        }
        if let Some(thresholds) = &update.thresholds {
            next.thresholds = thresholds.clone();
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Reject negative or non-finite thresholds.
pub fn validate_thresholds(thresholds: &ThresholdMap) -> Result<(), ConfigError> {
    for (metric, value) in thresholds {
        if !value.is_finite() || *value < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "threshold for '{}' must be a non-negative number, got {}",
                metric, value
            )));
        }
    }
    Ok(())
}

/// Settings taken from the environment.
///
/// Overrides win over the file at runtime but are never written back to it:
/// [`ConfigStore::save`] keeps the stored value of every overridden field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub device_id: Option<String>,
    pub update_frequency: Option<u64>,
    pub transport_url: Option<String>,
}

impl EnvOverrides {
    /// Read the overrides.
    ///
    /// Recognized variables:
    /// - `EDGE_TELEMETRY_DEVICE_ID`
    /// - `EDGE_TELEMETRY_UPDATE_FREQUENCY_SECS`
    /// - `EDGE_TELEMETRY_TRANSPORT_URL`
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            device_id: env::var("EDGE_TELEMETRY_DEVICE_ID").ok(),
            update_frequency: Self::parse_update_frequency()?,
            transport_url: env::var("EDGE_TELEMETRY_TRANSPORT_URL")
                .ok()
                .map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    /// Parse the update frequency override with validation.
    fn parse_update_frequency() -> Result<Option<u64>, ConfigError> {
        let var = "EDGE_TELEMETRY_UPDATE_FREQUENCY_SECS";

        match env::var(var) {
            Ok(value) => {
                let frequency: u64 = value.parse().map_err(|_| ConfigError::Env {
                    var: var.to_string(),
                    message: format!("'{}' is not a valid number", value),
                })?;

                if frequency == 0 {
                    return Err(ConfigError::Env {
                        var: var.to_string(),
                        message: "update frequency must be greater than 0".to_string(),
                    });
                }

                Ok(Some(frequency))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.device_id.is_none() && self.update_frequency.is_none() && self.transport_url.is_none()
    }

    pub fn apply(&self, config: &mut Config) {
        if let Some(device_id) = &self.device_id {
            config.device_id = device_id.clone();
        }
        if let Some(frequency) = self.update_frequency {
            config.update_frequency = frequency;
        }
        if let Some(url) = &self.transport_url {
            config.transport.url = url.clone();
        }
    }

    /// Copy every overridden field back from `stored`.
    pub fn restore(&self, config: &mut Config, stored: &Config) {
        if self.device_id.is_some() {
            config.device_id = stored.device_id.clone();
        }
        if self.update_frequency.is_some() {
            config.update_frequency = stored.update_frequency;
        }
        if self.transport_url.is_some() {
            config.transport.url = stored.transport.url.clone();
        }
    }
}

/// Partial configuration update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub device_id: Option<String>,
    pub customer_id: Option<String>,
    pub location: Option<String>,
    pub update_frequency: Option<u64>,
    pub transport: Option<TransportConfig>,
    pub thresholds: Option<ThresholdMap>,
}

/// Owns the on-disk location of the configuration document.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    overrides: EnvOverrides,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overrides: EnvOverrides::default(),
        }
    }

    /// Layer `overrides` over every loaded document.
    pub fn with_overrides(mut self, overrides: EnvOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn overrides(&self) -> &EnvOverrides {
        &self.overrides
    }

    /// Store at `EDGE_TELEMETRY_CONFIG`, or `config.json` when unset.
    pub fn from_env() -> Self {
        let path = env::var("EDGE_TELEMETRY_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration file, apply overrides and validate.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut config = self.read_document()?;
        self.overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// The document as stored, without overrides.
    fn read_document(&self) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        Ok(serde_json::from_str(&content)?)
    }

    /// Load the configuration, writing defaults back when the file is missing.
    ///
    /// A file that exists but fails to load is reported and replaced by
    /// defaults in memory only, so a typo never destroys the file.
    pub fn load_or_default(&self) -> Config {
        if self.path.exists() {
            match self.load() {
                Ok(config) => {
                    info!(path = %self.path.display(), "Configuration loaded");
                    return config;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Failed to load configuration, using defaults");
                    return self.defaults();
                }
            }
        }

        if let Err(e) = self.save(&Config::default()) {
            warn!(path = %self.path.display(), error = %e, "Failed to write default configuration");
        }
        self.defaults()
    }

    fn defaults(&self) -> Config {
        let mut config = Config::default();
        self.overrides.apply(&mut config);
        config
    }

    /// Write the whole configuration document.
    ///
    /// Overridden fields keep the value currently stored in the file.
    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut document = config.clone();
        if !self.overrides.is_empty() {
            let stored = self.read_document().unwrap_or_default();
            self.overrides.restore(&mut document, &stored);
        }

        let content = serde_json::to_string_pretty(&document)?;
        std::fs::write(&self.path, content).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
