//! Test helpers and utilities for integration tests

use std::time::Duration;
use telemetry_node::config::DeviceConfig;
use telemetry_node::controller::Controller;
use telemetry_node::sensors::SensorPoller;
use telemetry_node::session::Session;
use telemetry_node::shutdown::{self, ShutdownTrigger};
use telemetry_node::testing::{MockBroker, MockConnector};
use telemetry_node::transport::ConnectParams;

/// Device configuration used across the integration tests
#[allow(dead_code)]
pub fn test_config() -> DeviceConfig {
    DeviceConfig::from_toml_str(
        r#"
broker_host = "localhost"
broker_keepalive = 30
location = "greenhouse"

[sensors]
terrarium-cold = 1
terrarium-center = 2
terrarium-hot = 3
"#,
    )
    .expect("test config should parse")
}

/// Handshake parameters for a session talking to a [`MockBroker`]
#[allow(dead_code)]
pub fn test_params() -> ConnectParams {
    ConnectParams::from_config(&test_config(), "greenhouse")
}

/// A session bound to `broker` that can be interrupted through the returned trigger
#[allow(dead_code)]
pub fn test_session(broker: &MockBroker) -> (ShutdownTrigger, Session<MockConnector>) {
    let (trigger, signal) = shutdown::channel();
    let session = Session::new(broker.connector(), test_params()).with_shutdown(signal);
    (trigger, session)
}

/// A controller bound to `broker` with the given poller
#[allow(dead_code)]
pub fn test_controller(
    broker: &MockBroker,
    poller: SensorPoller,
) -> (ShutdownTrigger, Controller<MockConnector>) {
    let (trigger, signal) = shutdown::channel();
    let controller = Controller::new(&test_config(), broker.connector(), poller, signal);
    (trigger, controller)
}

/// Keepalive advertised by [`test_config`]
#[allow(dead_code)]
pub const KEEPALIVE: Duration = Duration::from_secs(30);
