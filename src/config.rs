//! Device configuration
//!
//! The configuration is a flat record (the same shape the device keeps in its
//! `config.json`). Fields belonging to collaborators outside the core (wifi,
//! NTP, maintenance console) are accepted and ignored. TOML is the default
//! format; files ending in `.json` are parsed as JSON.

use crate::protocol::validate_topic_segment;
use once_cell::sync::Lazy;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Broker hostname or IP address
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub broker_user: Option<String>,
    #[serde(default, alias = "broker_pass", skip_serializing)]
    pub broker_password: Option<String>,
    /// Keepalive advertised to the broker, in seconds
    #[serde(default = "default_keepalive")]
    pub broker_keepalive: u64,
    /// Connect with TLS (rustls, webpki roots)
    #[serde(default)]
    pub broker_tls: bool,
    /// Location label; used as client id and in diagnostic topics
    #[serde(default)]
    pub location: Option<String>,
    /// Explicit device id, used when no location is configured
    #[serde(default)]
    pub device_id: Option<String>,
    /// Root of the IIO device tree the sensor channels live under
    #[serde(default = "default_sensor_root")]
    pub sensor_root: PathBuf,
    /// Seconds between sampling iterations
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    /// Seconds to back off after an unexpected iteration fault
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Seconds subtracted from the keepalive to get the check-in interval
    #[serde(default = "default_keepalive_margin")]
    pub keepalive_margin_secs: u64,
    /// Sensor name to hardware channel, in configuration order
    pub sensors: SensorMap,
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    30
}

fn default_sensor_root() -> PathBuf {
    PathBuf::from("/sys/bus/iio/devices")
}

fn default_sample_interval() -> u64 {
    10
}

fn default_error_backoff() -> u64 {
    60
}

fn default_keepalive_margin() -> u64 {
    5
}

/// Minimum keepalive the MQTT client accepts
pub const MIN_KEEPALIVE_SECS: u64 = 5;

/// One configured sensor channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorChannel {
    pub name: String,
    pub channel: u32,
}

/// Ordered sensor name → channel mapping
///
/// Serialized as a plain map; deserialization keeps document order so that
/// readings are reported in the order the operator wrote them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorMap(Vec<SensorChannel>);

impl SensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a channel, keeping the original position on replace
    pub fn insert(&mut self, name: impl Into<String>, channel: u32) {
        let name = name.into();
        match self.0.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => entry.channel = channel,
            None => self.0.push(SensorChannel { name, channel }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorChannel> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.0
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.channel)
    }
}

impl<S: Into<String>> FromIterator<(S, u32)> for SensorMap {
    fn from_iter<I: IntoIterator<Item = (S, u32)>>(iter: I) -> Self {
        let mut map = SensorMap::new();
        for (name, channel) in iter {
            map.insert(name, channel);
        }
        map
    }
}

impl Serialize for SensorMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for entry in &self.0 {
            map.serialize_entry(&entry.name, &entry.channel)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SensorMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SensorMapVisitor;

        impl<'de> Visitor<'de> for SensorMapVisitor {
            type Value = SensorMap;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of sensor name to hardware channel id")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<SensorMap, A::Error> {
                let mut map = SensorMap::new();
                while let Some((name, channel)) = access.next_entry::<String, u32>()? {
                    map.insert(name, channel);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(SensorMapVisitor)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid sensor name: {0}")]
    InvalidSensorName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load configuration from a TOML or JSON file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the startup invariants the core relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker_host must not be empty".to_string(),
            ));
        }

        if self.sensors.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one sensor must be configured".to_string(),
            ));
        }

        for entry in self.sensors.iter() {
            validate_sensor_name(&entry.name)?;
        }

        if self.broker_keepalive < MIN_KEEPALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "broker_keepalive must be at least {MIN_KEEPALIVE_SECS}s, got {}s",
                self.broker_keepalive
            )));
        }

        if self.keepalive_margin_secs >= self.broker_keepalive {
            return Err(ConfigError::InvalidConfig(format!(
                "keepalive_margin_secs ({}) must be smaller than broker_keepalive ({})",
                self.keepalive_margin_secs, self.broker_keepalive
            )));
        }

        // The loop only pings between iterations, so one iteration must fit
        // inside the check-in interval.
        let check_in = self.check_in_interval().as_secs();
        if self.sample_interval_secs == 0 || self.sample_interval_secs >= check_in {
            return Err(ConfigError::InvalidConfig(format!(
                "sample_interval_secs ({}) must be between 1 and the check-in interval ({check_in}s)",
                self.sample_interval_secs
            )));
        }

        if self.error_backoff_secs < self.sample_interval_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "error_backoff_secs ({}) must not be shorter than sample_interval_secs ({})",
                self.error_backoff_secs, self.sample_interval_secs
            )));
        }

        if let Some(location) = &self.location {
            validate_topic_segment(location)
                .map_err(|e| ConfigError::InvalidConfig(format!("location '{location}': {e}")))?;
        }

        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.broker_keepalive)
    }

    /// Keepalive minus the safety margin
    pub fn check_in_interval(&self) -> Duration {
        Duration::from_secs(
            self.broker_keepalive
                .saturating_sub(self.keepalive_margin_secs),
        )
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// Identity used as MQTT client id and in diagnostic topics
    ///
    /// Location wins, then an explicit device id, then the machine id, then a
    /// random id generated once per process. Every call in one process
    /// returns the same value.
    pub fn identity(&self) -> String {
        if let Some(location) = &self.location {
            return location.clone();
        }
        if let Some(device_id) = &self.device_id {
            return device_id.clone();
        }
        machine_id().unwrap_or_else(|| PROCESS_ID.clone())
    }

    /// True when the identity is the per-process random id and changes on restart
    pub fn identity_is_ephemeral(&self) -> bool {
        self.location.is_none() && self.device_id.is_none() && machine_id().is_none()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
broker_host = "localhost"
location = "greenhouse"

[sensors]
terrarium-cold = 1
terrarium-center = 2
terrarium-hot = 3
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

static PROCESS_ID: Lazy<String> = Lazy::new(|| uuid::Uuid::new_v4().simple().to_string());

/// Read the host's stable machine id, if it has one
fn machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// Sensor names become a topic level, so MQTT wildcards and separators are out
fn validate_sensor_name(name: &str) -> Result<(), ConfigError> {
    validate_topic_segment(name)
        .map_err(|e| ConfigError::InvalidSensorName(format!("'{name}': {e}")))
}
