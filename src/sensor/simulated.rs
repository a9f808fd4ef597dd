//! Simulated built-in sensors.
//!
//! These stand in for the BMP280 and DHT22 chips on development machines.
//! Values follow a bounded random walk so downsampling has something
//! realistic to chew on.

use rand::Rng;

use super::registry::{SensorAvailability, SensorTypeInfo};
use super::{Sensor, SensorError};
use crate::config::SensorSettings;
use crate::reading::MetricMap;

const BMP280_ADDRESSES: [u64; 2] = [0x76, 0x77];
const DEFAULT_SEA_LEVEL_PRESSURE: f64 = 1013.25;
const DEFAULT_DHT22_PIN: u64 = 4;

/// Move `value` by at most `step` while staying within `[min, max]`.
fn walk(rng: &mut impl Rng, value: f64, step: f64, min: f64, max: f64) -> f64 {
    (value + rng.gen_range(-step..=step)).clamp(min, max)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Altitude in metres from the international barometric formula.
pub fn altitude_from_pressure(pressure_hpa: f64, sea_level_hpa: f64) -> f64 {
    44_330.0 * (1.0 - (pressure_hpa / sea_level_hpa).powf(1.0 / 5.255))
}

fn setting_u64(settings: &SensorSettings, key: &str, default: u64) -> Result<u64, SensorError> {
    match settings.get(key) {
        None => Ok(default),
        Some(value) => value.as_u64().ok_or_else(|| SensorError::InvalidSetting {
            key: key.to_string(),
            message: format!("expected an unsigned integer, got {}", value),
        }),
    }
}

fn setting_f64(settings: &SensorSettings, key: &str, default: f64) -> Result<f64, SensorError> {
    match settings.get(key) {
        None => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| SensorError::InvalidSetting {
            key: key.to_string(),
            message: format!("expected a number, got {}", value),
        }),
    }
}

/// Temperature and pressure sensor; altitude is derived from pressure.
#[derive(Debug)]
pub struct Bmp280Sensor {
    address: u64,
    sea_level_pressure: f64,
    initialized: bool,
    temperature: f64,
    pressure: f64,
}

impl Bmp280Sensor {
    pub const TYPE: &'static str = "BMP280";

    pub fn new(settings: &SensorSettings) -> Result<Self, SensorError> {
        let address = setting_u64(settings, "address", BMP280_ADDRESSES[0])?;
        if !BMP280_ADDRESSES.contains(&address) {
            return Err(SensorError::InvalidSetting {
                key: "address".to_string(),
                message: format!("0x{:02x} is not a BMP280 address (0x76 or 0x77)", address),
            });
        }

        let sea_level_pressure =
            setting_f64(settings, "sea_level_pressure", DEFAULT_SEA_LEVEL_PRESSURE)?;
        if !(900.0..=1100.0).contains(&sea_level_pressure) {
            return Err(SensorError::InvalidSetting {
                key: "sea_level_pressure".to_string(),
                message: format!("{} hPa is outside 900..=1100", sea_level_pressure),
            });
        }

        Ok(Self {
            address,
            sea_level_pressure,
            initialized: false,
            temperature: 21.0,
            pressure: sea_level_pressure,
        })
    }

    pub fn create(_id: &str, settings: &SensorSettings) -> Result<Box<dyn Sensor>, SensorError> {
        Ok(Box::new(Self::new(settings)?))
    }

    pub fn type_info() -> SensorTypeInfo {
        let mut default_config = SensorSettings::new();
        default_config.insert("address".to_string(), BMP280_ADDRESSES[0].into());
        default_config.insert(
            "sea_level_pressure".to_string(),
            DEFAULT_SEA_LEVEL_PRESSURE.into(),
        );

        SensorTypeInfo {
            name: Self::TYPE.to_string(),
            display_name: "BMP280 Temperature & Pressure".to_string(),
            metrics: vec![
                "temperature".to_string(),
                "pressure".to_string(),
                "altitude".to_string(),
            ],
            default_config,
            availability: SensorAvailability::Available,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }
}

impl Sensor for Bmp280Sensor {
    fn initialize(&mut self) -> bool {
        tracing::info!(address = format!("0x{:02x}", self.address), "BMP280 initialized");
        self.initialized = true;
        true
    }

    fn read(&mut self) -> Result<MetricMap, SensorError> {
        if !self.initialized {
            return Err(SensorError::NotInitialized);
        }

        let mut rng = rand::thread_rng();
        self.temperature = walk(&mut rng, self.temperature, 0.3, -40.0, 85.0);
        self.pressure = walk(&mut rng, self.pressure, 0.8, 300.0, 1100.0);
        let altitude = altitude_from_pressure(self.pressure, self.sea_level_pressure);

        let mut values = MetricMap::new();
        values.insert("temperature".to_string(), round2(self.temperature));
        values.insert("pressure".to_string(), round2(self.pressure));
        values.insert("altitude".to_string(), round2(altitude));
        Ok(values)
    }

    fn sensor_type(&self) -> &str {
        Self::TYPE
    }

    fn available_metrics(&self) -> Vec<String> {
        vec![
            "temperature".to_string(),
            "pressure".to_string(),
            "altitude".to_string(),
        ]
    }

    fn close(&mut self) {
        self.initialized = false;
    }
}

/// Temperature and humidity sensor.
#[derive(Debug)]
pub struct Dht22Sensor {
    pin: u64,
    initialized: bool,
    temperature: f64,
    humidity: f64,
}

impl Dht22Sensor {
    pub const TYPE: &'static str = "DHT22";

    pub fn new(settings: &SensorSettings) -> Result<Self, SensorError> {
        let pin = setting_u64(settings, "pin", DEFAULT_DHT22_PIN)?;
        if !(2..=27).contains(&pin) {
            return Err(SensorError::InvalidSetting {
                key: "pin".to_string(),
                message: format!("GPIO {} is outside BCM range 2..=27", pin),
            });
        }

        Ok(Self {
            pin,
            initialized: false,
            temperature: 22.0,
            humidity: 45.0,
        })
    }

    pub fn create(_id: &str, settings: &SensorSettings) -> Result<Box<dyn Sensor>, SensorError> {
        Ok(Box::new(Self::new(settings)?))
    }

    pub fn type_info() -> SensorTypeInfo {
        let mut default_config = SensorSettings::new();
        default_config.insert("pin".to_string(), DEFAULT_DHT22_PIN.into());

        SensorTypeInfo {
            name: Self::TYPE.to_string(),
            display_name: "DHT22 Temperature & Humidity".to_string(),
            metrics: vec!["temperature".to_string(), "humidity".to_string()],
            default_config,
            availability: SensorAvailability::ComingSoon,
        }
    }

    pub fn pin(&self) -> u64 {
        self.pin
    }
}

impl Sensor for Dht22Sensor {
    fn initialize(&mut self) -> bool {
        tracing::info!(pin = self.pin, "DHT22 initialized");
        self.initialized = true;
        true
    }

    fn read(&mut self) -> Result<MetricMap, SensorError> {
        if !self.initialized {
            return Err(SensorError::NotInitialized);
        }

        let mut rng = rand::thread_rng();
        self.temperature = walk(&mut rng, self.temperature, 0.2, -40.0, 80.0);
        self.humidity = walk(&mut rng, self.humidity, 1.0, 0.0, 100.0);

        let mut values = MetricMap::new();
        values.insert("temperature".to_string(), round2(self.temperature));
        values.insert("humidity".to_string(), round2(self.humidity));
        Ok(values)
    }

    fn sensor_type(&self) -> &str {
        Self::TYPE
    }

    fn available_metrics(&self) -> Vec<String> {
        vec!["temperature".to_string(), "humidity".to_string()]
    }

    fn close(&mut self) {
        self.initialized = false;
    }
}
