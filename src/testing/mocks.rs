//! Mock implementations for testing
//!
//! [`MockBroker`] is an in-memory stand-in for the MQTT broker. Hand out
//! connectors with [`MockBroker::connector`], script failures on the broker,
//! then inspect what was published. Every successful connect starts a new
//! connection generation; handles from older generations fail with
//! `ConnectionLost`, the way a dropped TCP link would.

use crate::sensors::{Measurement, Sensor, SensorError};
use crate::transport::{
    ConnectParams, Connector, DeliveryLevel, InboundMessage, Transport, TransportError,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A message the broker accepted
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub level: DeliveryLevel,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    generation: u64,
    connect_failures_remaining: u32,
    connect_attempts: u32,
    last_client_id: Option<String>,
    active_subscriptions: Vec<String>,
    subscribe_requests: Vec<String>,
    published: Vec<PublishedMessage>,
    pings: u32,
    inbound: VecDeque<InboundMessage>,
    fail_next_publish: bool,
    fail_next_subscribe: bool,
    fail_next_poll: bool,
}

impl BrokerState {
    /// Kill the current connection: clean session, so subscriptions go too
    fn sever(&mut self) {
        self.generation += 1;
        self.active_subscriptions.clear();
        self.inbound.clear();
    }
}

/// Shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            state: self.state.clone(),
        }
    }

    /// Refuse the next `count` connect attempts
    pub async fn fail_next_connects(&self, count: u32) {
        self.state.lock().await.connect_failures_remaining = count;
    }

    pub async fn fail_next_publish(&self) {
        self.state.lock().await.fail_next_publish = true;
    }

    pub async fn fail_next_subscribe(&self) {
        self.state.lock().await.fail_next_subscribe = true;
    }

    pub async fn fail_next_poll(&self) {
        self.state.lock().await.fail_next_poll = true;
    }

    /// Drop the live connection as if the link went away
    pub async fn drop_connection(&self) {
        self.state.lock().await.sever();
    }

    /// Deliver a message the way a broker would: only if someone is subscribed.
    /// Returns whether it was queued.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let mut state = self.state.lock().await;
        if !state.active_subscriptions.iter().any(|t| t == topic) {
            return false;
        }
        state.inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            retain: false,
        });
        true
    }

    /// Queue a message regardless of subscriptions
    pub async fn inject_unfiltered(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.state.lock().await.inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            retain: false,
        });
    }

    pub async fn connect_attempts(&self) -> u32 {
        self.state.lock().await.connect_attempts
    }

    pub async fn last_client_id(&self) -> Option<String> {
        self.state.lock().await.last_client_id.clone()
    }

    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.state.lock().await.active_subscriptions.clone()
    }

    /// Every SUBSCRIBE the broker accepted, across all connections
    pub async fn subscribe_requests(&self) -> Vec<String> {
        self.state.lock().await.subscribe_requests.clone()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn clear_published(&self) {
        self.state.lock().await.published.clear();
    }

    pub async fn pings(&self) -> u32 {
        self.state.lock().await.pings
    }
}

/// Connector bound to a [`MockBroker`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&mut self, params: &ConnectParams) -> Result<MockTransport, TransportError> {
        let mut state = self.state.lock().await;
        state.connect_attempts += 1;

        if state.connect_failures_remaining > 0 {
            state.connect_failures_remaining -= 1;
            return Err(TransportError::ConnectionFailed(
                "simulated network failure".to_string(),
            ));
        }

        state.sever();
        state.last_client_id = Some(params.client_id.clone());

        Ok(MockTransport {
            state: self.state.clone(),
            generation: state.generation,
        })
    }
}

/// One connection to a [`MockBroker`]
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
}

fn check_live(state: &BrokerState, generation: u64) -> Result<(), TransportError> {
    if state.generation == generation {
        Ok(())
    } else {
        Err(TransportError::ConnectionLost(
            "connection dropped".to_string(),
        ))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        check_live(&state, self.generation)?;

        if state.fail_next_publish {
            state.fail_next_publish = false;
            state.sever();
            return Err(TransportError::ConnectionLost(
                "simulated publish failure".to_string(),
            ));
        }

        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            level,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _level: DeliveryLevel) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        check_live(&state, self.generation)?;

        if state.fail_next_subscribe {
            state.fail_next_subscribe = false;
            state.sever();
            return Err(TransportError::ConnectionLost(
                "simulated subscribe failure".to_string(),
            ));
        }

        if !state.active_subscriptions.iter().any(|t| t == topic) {
            state.active_subscriptions.push(topic.to_string());
        }
        state.subscribe_requests.push(topic.to_string());
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        check_live(&state, self.generation)?;
        state.pings += 1;
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let mut state = self.state.lock().await;
        check_live(&state, self.generation)?;

        if state.fail_next_poll {
            state.fail_next_poll = false;
            state.sever();
            return Err(TransportError::ConnectionLost(
                "simulated poll failure".to_string(),
            ));
        }

        Ok(state.inbound.pop_front())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.generation == self.generation {
            state.active_subscriptions.clear();
        }
        Ok(())
    }
}

enum Script {
    Constant(Measurement),
    Failing(String),
    Sequence(VecDeque<Result<Measurement, SensorError>>),
    PanicsFirst { panics: u32, then: Measurement },
}

/// Scripted sensor
pub struct MockSensor {
    script: Script,
}

impl MockSensor {
    pub fn constant(temperature: f64, humidity: f64) -> Self {
        Self {
            script: Script::Constant(Measurement {
                temperature,
                humidity,
            }),
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            script: Script::Failing(reason.into()),
        }
    }

    /// Play back `results` in order, then report unavailable
    pub fn sequence(results: Vec<Result<Measurement, SensorError>>) -> Self {
        Self {
            script: Script::Sequence(results.into()),
        }
    }

    /// Panic on the first `panics` reads, then return a constant measurement
    pub fn panics_first(panics: u32, temperature: f64, humidity: f64) -> Self {
        Self {
            script: Script::PanicsFirst {
                panics,
                then: Measurement {
                    temperature,
                    humidity,
                },
            },
        }
    }
}

impl Sensor for MockSensor {
    fn measure(&mut self) -> Result<Measurement, SensorError> {
        match &mut self.script {
            Script::Constant(measurement) => Ok(*measurement),
            Script::Failing(reason) => Err(SensorError::Unavailable(reason.clone())),
            Script::Sequence(results) => results
                .pop_front()
                .unwrap_or_else(|| Err(SensorError::Unavailable("script exhausted".to_string()))),
            Script::PanicsFirst { panics, then } => {
                if *panics > 0 {
                    *panics -= 1;
                    panic!("simulated sensor driver panic");
                }
                Ok(*then)
            }
        }
    }
}
