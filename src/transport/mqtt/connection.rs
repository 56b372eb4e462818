//! Pure connection configuration for the MQTT transport
//!
//! This module contains pure functions that turn handshake parameters into
//! `rumqttc` options, plus the timeouts the client uses while driving the
//! event loop.

use crate::transport::{ConnectParams, DeliveryLevel};
use rumqttc::{MqttOptions, QoS, Transport as RumqttcTransport};
use std::time::Duration;

/// How long the client waits on the event loop for each kind of exchange
#[derive(Debug, Clone, PartialEq)]
pub struct MqttTimeouts {
    /// CONNECT → CONNACK
    pub connect: Duration,
    /// PUBLISH → PUBACK/PUBCOMP, SUBSCRIBE → SUBACK and PINGREQ → PINGRESP
    pub ack: Duration,
    /// Upper bound for one non-blocking inbound poll
    pub poll: Duration,
    /// DISCONNECT flush
    pub disconnect: Duration,
}

impl Default for MqttTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            ack: Duration::from_secs(5),
            poll: Duration::from_millis(20),
            disconnect: Duration::from_secs(1),
        }
    }
}

/// Request capacity of the `rumqttc` client queue
pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Pure function to configure MQTT options from handshake parameters
pub fn configure_mqtt_options(params: &ConnectParams) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&params.client_id, &params.host, params.port);

    mqtt_options.set_keep_alive(params.keepalive);
    // Every connect is a fresh session; subscriptions are re-issued by the session layer.
    mqtt_options.set_clean_session(true);

    if let Some(username) = &params.username {
        let password = params.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    if params.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options
}

/// Map a delivery level onto the MQTT QoS it corresponds to
pub fn qos_for(level: DeliveryLevel) -> QoS {
    match level {
        DeliveryLevel::AtMostOnce => QoS::AtMostOnce,
        DeliveryLevel::AtLeastOnce => QoS::AtLeastOnce,
        DeliveryLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}
