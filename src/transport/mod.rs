//! Transport layer for broker communication
//!
//! A [`Connector`] performs the broker handshake and hands back a fresh
//! [`Transport`] handle. Each successful connect yields a brand new handle
//! with no memory of earlier subscriptions; the session layer is responsible
//! for re-issuing them. The production implementation lives in [`mqtt`] and
//! is backed by `rumqttc`; tests use the in-memory double in
//! `crate::testing::mocks`.

use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Delivery assurance attached to a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryLevel {
    /// Fire-and-forget, no acknowledgement expected
    AtMostOnce,
    /// Acknowledged by the broker, may be duplicated
    AtLeastOnce,
    /// Acknowledged, no duplicates (reserved)
    ExactlyOnce,
}

impl DeliveryLevel {
    /// Whether the caller learns if the broker accepted the message
    pub fn is_acknowledged(self) -> bool {
        !matches!(self, DeliveryLevel::AtMostOnce)
    }
}

/// Parameters for the broker handshake
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    pub tls: bool,
}

impl ConnectParams {
    /// Build handshake parameters from the device configuration
    pub fn from_config(config: &crate::config::DeviceConfig, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            host: config.broker_host.clone(),
            port: config.broker_port,
            username: config.broker_user.clone(),
            password: config.broker_password.clone(),
            keepalive: config.keepalive(),
            tls: config.broker_tls,
        }
    }
}

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Transport failures; never surfaced past the session layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection refused by broker: {0}")]
    Refused(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Request rejected by broker: {0}")]
    Rejected(String),
    #[error("Client request queue error: {0}")]
    Client(String),
}

/// Factory for fresh broker connections
#[async_trait::async_trait]
pub trait Connector: Send {
    type Transport: Transport;

    /// Perform the handshake; success means the broker acknowledged the connection
    async fn connect(&mut self, params: &ConnectParams) -> Result<Self::Transport, TransportError>;
}

/// A single live connection to the broker
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Send a message; for acknowledged levels, resolves once the broker accepted it
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Subscribe and wait for the broker to confirm
    async fn subscribe(&mut self, topic: &str, level: DeliveryLevel) -> Result<(), TransportError>;

    /// Keep the broker session alive
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Return at most one pending inbound message without blocking for long
    async fn poll(&mut self) -> Result<Option<InboundMessage>, TransportError>;

    /// Close the connection politely
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Type alias for the production connector
pub type MqttConnector = mqtt::MqttConnector;
