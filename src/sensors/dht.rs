//! DHT22 / AM2302 through the Linux IIO `dht11` driver
//!
//! The kernel exposes each sensor as `iio:device<N>` with two attributes in
//! milli-units:
//!
//! ```text
//! <root>/iio:device<N>/in_temp_input                 21500  -> 21.5 °C
//! <root>/iio:device<N>/in_humidityrelative_input     40300  -> 40.3 %RH
//! ```
//!
//! A failed bus transaction surfaces as an I/O error on read (usually EIO).

use super::{Measurement, Sensor, SensorError};
use std::path::{Path, PathBuf};

const TEMPERATURE_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";

/// Physical range of the DHT22 temperature element, °C
pub const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 80.0);
/// Physical range of the DHT22 humidity element, %RH
pub const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);

/// One DHT22 on an IIO channel
#[derive(Debug, Clone)]
pub struct IioDhtSensor {
    device_dir: PathBuf,
}

impl IioDhtSensor {
    pub fn new(root: &Path, channel: u32) -> Self {
        Self {
            device_dir: root.join(format!("iio:device{channel}")),
        }
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    fn read_milli(&self, file: &str) -> Result<f64, SensorError> {
        let path = self.device_dir.join(file);
        let raw = std::fs::read_to_string(&path).map_err(|source| SensorError::Io {
            path: path.clone(),
            source,
        })?;

        let value = raw.trim();
        value
            .parse::<i64>()
            .map(|milli| milli as f64 / 1000.0)
            .map_err(|_| SensorError::Malformed {
                path,
                value: value.to_string(),
            })
    }
}

/// Reject values outside the element's physical range (pure function)
pub fn check_range(
    quantity: &'static str,
    value: f64,
    (min, max): (f64, f64),
) -> Result<f64, SensorError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(SensorError::OutOfRange { quantity, value })
    }
}

impl Sensor for IioDhtSensor {
    fn measure(&mut self) -> Result<Measurement, SensorError> {
        let temperature = check_range(
            "temperature",
            self.read_milli(TEMPERATURE_FILE)?,
            TEMPERATURE_RANGE,
        )?;
        let humidity = check_range("humidity", self.read_milli(HUMIDITY_FILE)?, HUMIDITY_RANGE)?;

        Ok(Measurement {
            temperature,
            humidity,
        })
    }
}
