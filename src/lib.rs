//! Telemetry Node - resilient MQTT sensor reporting
//!
//! A headless device process that samples environmental sensors and reports
//! readings to an MQTT broker, staying alive indefinitely on unreliable links.
//!
//! # Overview
//!
//! - [`session`] - sole owner of the broker connection; reconnects on any failure
//! - [`keepalive`] - cooperative ping/dispatch step, called once per iteration
//! - [`sensors`] - per-channel fault-isolated sampling (IIO DHT22 driver)
//! - [`commands`] - inbound command handlers (`check-in`)
//! - [`controller`] - the main loop with iteration-boundary fault recovery
//! - [`transport`] - the connector/transport seam and its `rumqttc` implementation
//!
//! # Quick Start
//!
//! ```rust
//! use telemetry_node::commands::{CheckInHandler, CommandHandler};
//! use telemetry_node::protocol::{CommandMessage, TopicBuilder};
//!
//! let mut handler = CheckInHandler::new("greenhouse");
//! let replies = handler.handle(&CommandMessage::new(TopicBuilder::broadcast_commands(), "check-in"));
//!
//! assert_eq!(replies.len(), 1);
//! assert_eq!(replies[0].topic, "Notifications/check-in-reply");
//! assert_eq!(replies[0].payload, b"greenhouse".to_vec());
//! ```

pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod keepalive;
pub mod observability;
pub mod protocol;
pub mod reporter;
pub mod sensors;
pub mod session;
pub mod shutdown;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, DeviceConfig};
pub use controller::{Controller, ControllerState};
pub use error::{DeviceError, DeviceResult};
pub use session::{DispatchOutcome, Session, SessionError};
