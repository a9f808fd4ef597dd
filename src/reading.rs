//! Reading types produced by sensors and published to the telemetry sink.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metric name to measured value.
pub type MetricMap = BTreeMap<String, f64>;

/// Outcome of a single sensor poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    Ok,
    Error,
}

impl std::fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadingStatus::Ok => write!(f, "ok"),
            ReadingStatus::Error => write!(f, "error"),
        }
    }
}

/// One poll of one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub sensor_type: String,
    pub timestamp: DateTime<Utc>,

    /// Measured values; empty for error readings
    pub readings: MetricMap,

    pub status: ReadingStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Consecutive failed reads of this sensor
    #[serde(default)]
    pub error_count: u32,
}

impl Reading {
    /// Create a successful reading timestamped now.
    pub fn ok(
        sensor_id: impl Into<String>,
        sensor_type: impl Into<String>,
        readings: MetricMap,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type: sensor_type.into(),
            timestamp: Utc::now(),
            readings,
            status: ReadingStatus::Ok,
            error: None,
            error_count: 0,
        }
    }

    /// Create a failed reading timestamped now.
    pub fn error(
        sensor_id: impl Into<String>,
        sensor_type: impl Into<String>,
        error: impl Into<String>,
        error_count: u32,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type: sensor_type.into(),
            timestamp: Utc::now(),
            readings: MetricMap::new(),
            status: ReadingStatus::Error,
            error: Some(error.into()),
            error_count,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReadingStatus::Ok
    }
}

/// Device identity attached to every published reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub customer_id: String,
    pub location: String,
}

impl DeviceMetadata {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            device_id: config.device_id.clone(),
            customer_id: config.customer_id.clone(),
            location: config.location.clone(),
        }
    }
}

/// A reading tagged with device metadata, ready for dispatch.
///
/// Serializes as a flat JSON object so the sink sees one record per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRecord {
    /// Client-generated id so the sink can de-duplicate replays
    pub message_id: Uuid,

    #[serde(flatten)]
    pub reading: Reading,

    #[serde(flatten)]
    pub device: DeviceMetadata,
}

impl PublishRecord {
    pub fn new(reading: Reading, device: DeviceMetadata) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            reading,
            device,
        }
    }

    /// Encode as the JSON message body handed to the transport.
    pub fn to_message(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceMetadata {
        DeviceMetadata {
            device_id: "rpi_001".to_string(),
            customer_id: "customer_001".to_string(),
            location: "lab".to_string(),
        }
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&ReadingStatus::Ok).unwrap(), "\"ok\"");
        assert_eq!(serde_json::to_string(&ReadingStatus::Error).unwrap(), "\"error\"");
        assert_eq!(ReadingStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_error_reading_has_no_metrics() {
        let reading = Reading::error("env", "BMP280", "i2c timeout", 3);
        assert!(!reading.is_ok());
        assert!(reading.readings.is_empty());
        assert_eq!(reading.error.as_deref(), Some("i2c timeout"));
        assert_eq!(reading.error_count, 3);
    }

    #[test]
    fn test_publish_record_is_flat_json() {
        let mut metrics = MetricMap::new();
        metrics.insert("temperature".to_string(), 21.5);
        let record = PublishRecord::new(Reading::ok("env", "BMP280", metrics), device());

        let value: serde_json::Value = serde_json::from_slice(&record.to_message().unwrap()).unwrap();
        assert_eq!(value["sensor_id"], "env");
        assert_eq!(value["device_id"], "rpi_001");
        assert_eq!(value["location"], "lab");
        assert_eq!(value["status"], "ok");
        assert_eq!(value["readings"]["temperature"], 21.5);
        assert!(value.get("error").is_none());
        assert!(value["message_id"].is_string());
    }

    #[test]
    fn test_device_metadata_from_config() {
        let config = crate::config::Config::default();
        let device = DeviceMetadata::from_config(&config);
        assert_eq!(device.device_id, config.device_id);
        assert_eq!(device.customer_id, config.customer_id);
        assert_eq!(device.location, config.location);
    }
}
