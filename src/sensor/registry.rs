//! Name to constructor registry for sensor variants.

use std::collections::BTreeMap;

use serde::Serialize;

use super::simulated::{Bmp280Sensor, Dht22Sensor};
use super::{Sensor, SensorError};
use crate::config::SensorSettings;

/// Builds a sensor from its id and settings.
pub type SensorFactory = fn(&str, &SensorSettings) -> Result<Box<dyn Sensor>, SensorError>;

/// Whether a registered type is ready for use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorAvailability {
    Available,
    ComingSoon,
}

/// Descriptive metadata for a registered sensor type.
#[derive(Debug, Clone, Serialize)]
pub struct SensorTypeInfo {
    pub name: String,
    pub display_name: String,
    pub metrics: Vec<String>,
    pub default_config: SensorSettings,
    pub availability: SensorAvailability,
}

struct Registration {
    info: SensorTypeInfo,
    factory: SensorFactory,
}

/// Registry of constructible sensor types.
#[derive(Default)]
pub struct SensorRegistry {
    types: BTreeMap<String, Registration>,
}

impl SensorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `BMP280` and `DHT22` types.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Bmp280Sensor::type_info(), Bmp280Sensor::create);
        registry.register(Dht22Sensor::type_info(), Dht22Sensor::create);
        registry
    }

    /// Register or replace a sensor type.
    pub fn register(&mut self, info: SensorTypeInfo, factory: SensorFactory) {
        self.types
            .insert(info.name.clone(), Registration { info, factory });
    }

    /// Construct a sensor of the given type. `None` if the type is unknown.
    pub fn create(
        &self,
        sensor_type: &str,
        id: &str,
        settings: &SensorSettings,
    ) -> Option<Result<Box<dyn Sensor>, SensorError>> {
        self.types
            .get(sensor_type)
            .map(|registration| (registration.factory)(id, settings))
    }

    pub fn contains(&self, sensor_type: &str) -> bool {
        self.types.contains_key(sensor_type)
    }

    pub fn info(&self, sensor_type: &str) -> Option<&SensorTypeInfo> {
        self.types.get(sensor_type).map(|r| &r.info)
    }

    /// Metadata for every registered type, ordered by name.
    pub fn available(&self) -> Vec<SensorTypeInfo> {
        self.types.values().map(|r| r.info.clone()).collect()
    }
}

impl std::fmt::Debug for SensorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.types.keys()).finish()
    }
}
