//! Sensor sampling with per-channel fault isolation
//!
//! [`SensorPoller`] owns every configured channel. A failing channel is
//! logged and skipped for the cycle; it never aborts the batch.

pub mod dht;

use crate::config::DeviceConfig;
use crate::protocol::ReadingPayload;
use crate::sensor_span;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

pub use dht::IioDhtSensor;

/// Failure of a single measurement
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed value {value:?} in {path}")]
    Malformed { path: PathBuf, value: String },

    #[error("{quantity} out of range: {value}")]
    OutOfRange { quantity: &'static str, value: f64 },

    #[error("Sensor unavailable: {0}")]
    Unavailable(String),
}

/// One raw measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// °C
    pub temperature: f64,
    /// %RH
    pub humidity: f64,
}

/// A measurement device behind one channel
pub trait Sensor: Send {
    fn measure(&mut self) -> Result<Measurement, SensorError>;
}

/// A successful measurement, tagged with its channel name
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub name: String,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    pub fn payload(&self) -> ReadingPayload {
        ReadingPayload::new(self.temperature, self.humidity)
    }
}

/// A channel that failed during the last cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFault {
    pub name: String,
    pub error: String,
}

struct Channel {
    name: String,
    sensor: Box<dyn Sensor>,
}

/// Reads every configured channel once per cycle
#[derive(Default)]
pub struct SensorPoller {
    channels: Vec<Channel>,
    last_faults: Vec<SensorFault>,
}

impl SensorPoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the production poller: one IIO DHT22 per configured channel
    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut poller = Self::new();
        for entry in config.sensors.iter() {
            poller.add(
                entry.name.clone(),
                IioDhtSensor::new(&config.sensor_root, entry.channel),
            );
        }
        poller
    }

    /// Channels are read in the order they were added
    pub fn add<S>(&mut self, name: impl Into<String>, sensor: S)
    where
        S: Sensor + 'static,
    {
        self.channels.push(Channel {
            name: name.into(),
            sensor: Box::new(sensor),
        });
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name.as_str()).collect()
    }

    /// Measure every channel once; returns the successful readings in channel order
    pub fn read_all(&mut self) -> Vec<SensorReading> {
        self.last_faults.clear();
        let mut readings = Vec::with_capacity(self.channels.len());

        for channel in &mut self.channels {
            let _span = sensor_span!(sensor = %channel.name).entered();

            match channel.sensor.measure() {
                Ok(measurement) => {
                    debug!(
                        temperature = measurement.temperature,
                        humidity = measurement.humidity,
                        "Sensor read"
                    );
                    readings.push(SensorReading {
                        name: channel.name.clone(),
                        temperature: measurement.temperature,
                        humidity: measurement.humidity,
                        timestamp: Utc::now(),
                    });
                }
                Err(error) => {
                    warn!(sensor = %channel.name, error = %error, "Sensor read failed");
                    self.last_faults.push(SensorFault {
                        name: channel.name.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }

        readings
    }

    /// Faults recorded by the most recent [`read_all`](Self::read_all)
    pub fn last_faults(&self) -> &[SensorFault] {
        &self.last_faults
    }
}
