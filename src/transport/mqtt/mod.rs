//! MQTT 3.1.1 transport backed by `rumqttc`
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - Pure option building and timeouts
//! - [`message_handler`] - Pure event routing
//! - [`client`] - Impure event loop driving
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use telemetry_node::transport::mqtt::MqttConnector;
//! use telemetry_node::transport::{ConnectParams, Connector, DeliveryLevel, Transport};
//!
//! # tokio_test::block_on(async {
//! let params = ConnectParams {
//!     client_id: "greenhouse".to_string(),
//!     host: "localhost".to_string(),
//!     port: 1883,
//!     username: None,
//!     password: None,
//!     keepalive: Duration::from_secs(30),
//!     tls: false,
//! };
//!
//! let mut transport = MqttConnector::new().connect(&params).await?;
//! transport
//!     .publish("Logs/greenhouse/Logs", b"online".to_vec(), DeliveryLevel::AtLeastOnce, false)
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttTransport};
pub use connection::{configure_mqtt_options, qos_for, MqttTimeouts};
pub use message_handler::{EventRoute, MessageHandler};
