//! Sensor capability trait and per-sensor bookkeeping.
//!
//! A [`Sensor`] is the hardware-facing unit. The collection loop never talks
//! to one directly; it goes through a [`SensorHandle`], which tracks
//! activity, the last reading and the consecutive error count, and turns
//! read failures into error readings.

pub mod registry;
pub mod simulated;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SensorSettings;
use crate::reading::{MetricMap, Reading};

pub use registry::{SensorAvailability, SensorFactory, SensorRegistry, SensorTypeInfo};

/// Errors raised by sensor implementations.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor not initialized")]
    NotInitialized,

    #[error("invalid sensor setting '{key}': {message}")]
    InvalidSetting { key: String, message: String },

    #[error("read failed: {0}")]
    Read(String),
}

/// Capability set every sensor variant provides.
pub trait Sensor: Send {
    /// Bring up the hardware. Returns `false` if the sensor is unusable.
    fn initialize(&mut self) -> bool;

    /// Sample the current metric values.
    fn read(&mut self) -> Result<MetricMap, SensorError>;

    /// Registered type tag, e.g. `BMP280`.
    fn sensor_type(&self) -> &str;

    /// Metric names this sensor can produce.
    fn available_metrics(&self) -> Vec<String>;

    /// Release hardware resources.
    fn close(&mut self) {}
}

/// Status snapshot of a managed sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStatus {
    pub sensor_id: String,
    pub sensor_type: String,
    pub is_active: bool,
    pub last_reading_time: Option<DateTime<Utc>>,
    pub last_reading: Option<MetricMap>,
    pub error_count: u32,
    pub config: SensorSettings,
}

/// A sensor owned by the manager together with its bookkeeping.
pub struct SensorHandle {
    id: String,
    config: SensorSettings,
    sensor: Box<dyn Sensor>,
    metrics: Vec<String>,
    is_active: bool,
    last_reading: Option<MetricMap>,
    last_reading_time: Option<DateTime<Utc>>,
    error_count: u32,
}

impl SensorHandle {
    pub fn new(id: impl Into<String>, config: SensorSettings, sensor: Box<dyn Sensor>) -> Self {
        let metrics = sensor.available_metrics();
        Self {
            id: id.into(),
            config,
            sensor,
            metrics,
            is_active: true,
            last_reading: None,
            last_reading_time: None,
            error_count: 0,
        }
    }

    pub fn sensor_type(&self) -> &str {
        self.sensor.sensor_type()
    }

    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Initialize the underlying sensor, marking it inactive on failure.
    pub fn initialize(&mut self) -> bool {
        let ok = self.sensor.initialize();
        if !ok {
            self.is_active = false;
        }
        ok
    }

    /// Poll the sensor once.
    ///
    /// A failed read yields an error reading and bumps the consecutive error
    /// count; a successful one resets it. Metrics outside the declared
    /// capability set are discarded.
    pub fn read(&mut self) -> Reading {
        match self.sensor.read() {
            Ok(mut values) => {
                let before = values.len();
                values.retain(|metric, _| self.metrics.iter().any(|m| m == metric));
                if values.len() != before {
                    warn!(
                        sensor_id = %self.id,
                        dropped = before - values.len(),
                        "Discarded undeclared metrics from sensor read"
                    );
                }

                let reading = Reading::ok(self.id.clone(), self.sensor.sensor_type(), values);
                self.last_reading = Some(reading.readings.clone());
                self.last_reading_time = Some(reading.timestamp);
                self.error_count = 0;
                reading
            }
            Err(e) => {
                self.error_count = self.error_count.saturating_add(1);
                debug!(
                    sensor_id = %self.id,
                    error = %e,
                    error_count = self.error_count,
                    "Sensor read failed"
                );
                Reading::error(
                    self.id.clone(),
                    self.sensor.sensor_type(),
                    e.to_string(),
                    self.error_count,
                )
            }
        }
    }

    pub fn close(&mut self) {
        self.sensor.close();
        self.is_active = false;
    }

    pub fn status(&self) -> SensorStatus {
        SensorStatus {
            sensor_id: self.id.clone(),
            sensor_type: self.sensor.sensor_type().to_string(),
            is_active: self.is_active,
            last_reading_time: self.last_reading_time,
            last_reading: self.last_reading.clone(),
            error_count: self.error_count,
            config: self.config.clone(),
        }
    }
}

impl std::fmt::Debug for SensorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorHandle")
            .field("id", &self.id)
            .field("sensor_type", &self.sensor.sensor_type())
            .field("is_active", &self.is_active)
            .field("error_count", &self.error_count)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Sensor that replays scripted results, then repeats the last one.
    pub struct ScriptedSensor {
        pub init_ok: bool,
        /// Blocking delay before every read, like a slow bus transaction
        pub read_delay: std::time::Duration,
        pub metrics: Vec<String>,
        pub script: VecDeque<Result<MetricMap, String>>,
        last: Option<Result<MetricMap, String>>,
    }

    impl ScriptedSensor {
        pub fn new(metrics: &[&str], script: Vec<Result<MetricMap, String>>) -> Self {
            Self {
                init_ok: true,
                read_delay: std::time::Duration::ZERO,
                metrics: metrics.iter().map(|m| m.to_string()).collect(),
                script: script.into(),
                last: None,
            }
        }
    }

    impl Sensor for ScriptedSensor {
        fn initialize(&mut self) -> bool {
            self.init_ok
        }

        fn read(&mut self) -> Result<MetricMap, SensorError> {
            if !self.read_delay.is_zero() {
                std::thread::sleep(self.read_delay);
            }
            if let Some(next) = self.script.pop_front() {
                self.last = Some(next);
            }
            match &self.last {
                Some(Ok(values)) => Ok(values.clone()),
                Some(Err(message)) => Err(SensorError::Read(message.clone())),
                None => Err(SensorError::NotInitialized),
            }
        }

        fn sensor_type(&self) -> &str {
            "SCRIPTED"
        }

        fn available_metrics(&self) -> Vec<String> {
            self.metrics.clone()
        }
    }

    pub fn metrics(pairs: &[(&str, f64)]) -> MetricMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }
}
