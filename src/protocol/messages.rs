//! Message shapes exchanged with the broker

use crate::transport::DeliveryLevel;
use serde::{Deserialize, Serialize};

/// An inbound command, handed once to the handler registered for its topic
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl CommandMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text with surrounding whitespace removed; invalid UTF-8 is replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim().to_string()
    }
}

/// A message a command handler asks the session to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub level: DeliveryLevel,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, level: DeliveryLevel) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            level,
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// Body published on `Sensors/<name>`
///
/// Values travel as strings with exactly two decimals, e.g.
/// `{"temperature": "21.50", "humidity": "40.00"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingPayload {
    pub temperature: String,
    pub humidity: String,
}

impl ReadingPayload {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature: format!("{temperature:.2}"),
            humidity: format!("{humidity:.2}"),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
