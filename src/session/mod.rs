//! Broker session: the single owner of the connection
//!
//! [`Session`] wraps a [`Connector`] and at most one live [`Transport`]
//! handle. It absorbs every transport failure by reconnecting, so callers only
//! ever see [`SessionError`], never a raw transport error.
//!
//! The subscription set kept here is authoritative. A fresh transport has no
//! memory of earlier subscriptions, so after every successful connect the
//! whole set is re-issued before the session reports itself connected.

pub mod health_monitor;

use crate::commands::CommandHandler;
use crate::protocol::CommandMessage;
use crate::shutdown::ShutdownSignal;
use crate::transport::{ConnectParams, Connector, DeliveryLevel, Transport, TransportError};
use health_monitor::{HealthMetrics, HealthMonitor, ReconnectionDecision};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session-level failures
#[derive(Debug, Error)]
pub enum SessionError {
    /// Shutdown was requested while the session was waiting to retry
    #[error("Shutdown requested")]
    ShutdownRequested,

    /// The reconnect policy gave up (only possible with an attempt cap)
    #[error("Connect failed after {attempts} attempts: {reason}")]
    ConnectFailed { attempts: u32, reason: String },

    /// An acknowledged publish did not reach the broker; the session has already reconnected
    #[error("Message to {topic} not delivered at {level:?}")]
    NotDelivered { topic: String, level: DeliveryLevel },
}

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Retry behaviour of the connect loop
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Sleep between failed connect attempts
    pub retry_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Production policy: retry every keepalive/2, forever
    pub fn from_keepalive(keepalive: Duration) -> Self {
        Self {
            retry_delay: keepalive / 2,
            max_attempts: None,
        }
    }
}

/// What a single [`Session::dispatch`] call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No message was pending
    Idle,
    /// A handler consumed a message on this topic
    Handled { topic: String },
    /// A message arrived on a topic with no handler
    Unhandled { topic: String },
    /// The transport failed and the session reconnected
    Recovered,
}

struct Subscription {
    topic: String,
    level: DeliveryLevel,
    handler: Box<dyn CommandHandler>,
}

/// The one connection to the broker
pub struct Session<C: Connector> {
    connector: C,
    params: ConnectParams,
    transport: Option<C::Transport>,
    state: ConnectionState,
    subscriptions: Vec<Subscription>,
    policy: ReconnectPolicy,
    shutdown: Option<ShutdownSignal>,
    last_ping: Option<Instant>,
    connect_time: Option<Instant>,
    last_message_time: Option<Instant>,
    last_activity: Option<Instant>,
    reconnect_count: u32,
    /// Set by the first successful connect; before that there is nothing to *re*connect
    has_connected: bool,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C, params: ConnectParams) -> Self {
        let policy = ReconnectPolicy::from_keepalive(params.keepalive);
        Self {
            connector,
            params,
            transport: None,
            state: ConnectionState::Disconnected,
            subscriptions: Vec::new(),
            policy,
            shutdown: None,
            last_ping: None,
            connect_time: None,
            last_message_time: None,
            last_activity: None,
            reconnect_count: 0,
            has_connected: false,
        }
    }

    /// Let the connect loop observe the process shutdown flag
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn client_id(&self) -> &str {
        &self.params.client_id
    }

    pub fn last_ping(&self) -> Option<Instant> {
        self.last_ping
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    /// Topics in the authoritative subscription set, in registration order
    pub fn subscribed_topics(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.topic.as_str()).collect()
    }

    /// Connect, retrying every `retry_delay` until the broker accepts us and
    /// every recorded subscription is active again.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let mut failed_attempts = 0u32;

        loop {
            self.set_state(ConnectionState::Connecting);

            let error = match self.try_connect().await {
                Ok(()) => {
                    let now = Instant::now();
                    self.connect_time = Some(now);
                    self.last_activity = Some(now);
                    self.has_connected = true;
                    self.set_state(ConnectionState::Connected);
                    info!(
                        client_id = %self.params.client_id,
                        subscriptions = self.subscriptions.len(),
                        attempts = failed_attempts + 1,
                        "Connected to broker"
                    );
                    return Ok(());
                }
                Err(error) => error,
            };

            failed_attempts += 1;
            self.transport = None;
            self.set_state(ConnectionState::Disconnected);

            match HealthMonitor::should_attempt_reconnection(
                failed_attempts,
                &self.policy,
                self.shutdown_requested(),
            ) {
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, abandoning connect loop");
                    return Err(SessionError::ShutdownRequested);
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    return Err(SessionError::ConnectFailed {
                        attempts: failed_attempts,
                        reason: error.to_string(),
                    });
                }
                ReconnectionDecision::Proceed { attempt, delay } => {
                    warn!(
                        error = %error,
                        next_attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Broker connect failed"
                    );
                    if !self.sleep(delay).await {
                        info!("Shutdown requested, abandoning connect loop");
                        return Err(SessionError::ShutdownRequested);
                    }
                }
            }
        }
    }

    /// One handshake plus the full re-subscribe; the handle is kept only if both succeed
    async fn try_connect(&mut self) -> Result<(), TransportError> {
        let mut transport = self.connector.connect(&self.params).await?;

        let topics: Vec<(String, DeliveryLevel)> = self
            .subscriptions
            .iter()
            .map(|s| (s.topic.clone(), s.level))
            .collect();
        for (topic, level) in topics {
            transport.subscribe(&topic, level).await?;
            debug!(topic = %topic, "Re-issued subscription");
        }

        self.transport = Some(transport);
        Ok(())
    }

    /// Drop the current handle (politely if possible) and connect again.
    ///
    /// Only counted as a reconnect once the session has been connected before.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        if let Some(mut transport) = self.transport.take() {
            if let Err(error) = transport.disconnect().await {
                debug!(error = %error, "Best-effort disconnect failed");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        if self.has_connected {
            self.reconnect_count += 1;
            info!(reconnect_count = self.reconnect_count, "Reconnecting to broker");
        } else {
            info!("Connecting to broker for the first time");
        }
        self.connect().await
    }

    /// Publish a message.
    ///
    /// At-most-once always reports success. For acknowledged levels the
    /// result reflects whether the broker accepted this send; a failed send is
    /// not retried after the reconnect.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), SessionError> {
        let payload = payload.into();

        if self.transport.is_none() {
            self.reconnect().await?;
        }

        let result = match self.transport.as_mut() {
            Some(transport) => transport.publish(topic, payload, level, retain).await,
            None => Err(TransportError::ConnectionLost("no transport".to_string())),
        };

        match result {
            Ok(()) => {
                self.last_activity = Some(Instant::now());
                debug!(topic = %topic, ?level, "Published");
                Ok(())
            }
            Err(error) => {
                warn!(topic = %topic, ?level, error = %error, "Publish failed");
                self.mark_lost();
                self.reconnect().await?;
                if level.is_acknowledged() {
                    Err(SessionError::NotDelivered {
                        topic: topic.to_string(),
                        level,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Record `handler` for `topic` and subscribe if connected.
    ///
    /// Re-subscribing an existing topic replaces its handler. While
    /// disconnected the broker request waits for the next connect.
    pub async fn subscribe<H>(
        &mut self,
        topic: &str,
        level: DeliveryLevel,
        handler: H,
    ) -> Result<(), SessionError>
    where
        H: CommandHandler + 'static,
    {
        let handler: Box<dyn CommandHandler> = Box::new(handler);
        match self.subscriptions.iter_mut().find(|s| s.topic == topic) {
            Some(existing) => {
                existing.level = level;
                existing.handler = handler;
            }
            None => self.subscriptions.push(Subscription {
                topic: topic.to_string(),
                level,
                handler,
            }),
        }

        let Some(transport) = self.transport.as_mut() else {
            debug!(topic = %topic, "Subscription deferred until connected");
            return Ok(());
        };

        match transport.subscribe(topic, level).await {
            Ok(()) => {
                self.last_activity = Some(Instant::now());
                info!(topic = %topic, "Subscribed");
                Ok(())
            }
            Err(error) => {
                warn!(topic = %topic, error = %error, "Subscribe failed");
                self.mark_lost();
                // The connect procedure re-issues the whole set, this topic included
                self.reconnect().await
            }
        }
    }

    /// Protocol-level keepalive
    pub async fn ping(&mut self) -> Result<(), SessionError> {
        let Some(transport) = self.transport.as_mut() else {
            return self.reconnect().await;
        };

        match transport.ping().await {
            Ok(()) => {
                let now = Instant::now();
                self.last_ping = Some(now);
                self.last_activity = Some(now);
                debug!("Keepalive ping");
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "Keepalive ping failed");
                self.mark_lost();
                self.reconnect().await
            }
        }
    }

    /// Poll for one inbound message and hand it to the handler registered
    /// for exactly that topic. Replies are published before returning.
    pub async fn dispatch(&mut self) -> Result<DispatchOutcome, SessionError> {
        let Some(transport) = self.transport.as_mut() else {
            self.reconnect().await?;
            return Ok(DispatchOutcome::Recovered);
        };

        let message = match transport.poll().await {
            Ok(None) => return Ok(DispatchOutcome::Idle),
            Ok(Some(message)) => message,
            Err(error) => {
                warn!(error = %error, "Inbound poll failed");
                self.mark_lost();
                self.reconnect().await?;
                return Ok(DispatchOutcome::Recovered);
            }
        };

        let now = Instant::now();
        self.last_message_time = Some(now);
        self.last_activity = Some(now);

        let command = CommandMessage::new(message.topic, message.payload);
        let Some(subscription) = self
            .subscriptions
            .iter_mut()
            .find(|s| s.topic == command.topic)
        else {
            debug!(topic = %command.topic, "No handler for inbound message");
            return Ok(DispatchOutcome::Unhandled {
                topic: command.topic,
            });
        };

        let replies = subscription.handler.handle(&command);
        debug!(topic = %command.topic, replies = replies.len(), "Command handled");

        for reply in replies {
            match self
                .publish(&reply.topic, reply.payload, reply.level, reply.retain)
                .await
            {
                Ok(()) => {}
                Err(SessionError::NotDelivered { topic, level }) => {
                    warn!(topic = %topic, ?level, "Command reply not delivered");
                }
                Err(other) => return Err(other),
            }
        }

        Ok(DispatchOutcome::Handled {
            topic: command.topic,
        })
    }

    /// Graceful close at shutdown
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            match transport.disconnect().await {
                Ok(()) => info!("Disconnected from broker"),
                Err(error) => warn!(error = %error, "Disconnect was not clean"),
            }
        }
        self.connect_time = None;
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn health(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(
            Instant::now(),
            self.connect_time,
            self.last_message_time,
            self.last_activity,
            self.reconnect_count,
            self.params.keepalive * 2,
        )
    }

    fn mark_lost(&mut self) {
        self.transport = None;
        self.connect_time = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, next: ConnectionState) {
        HealthMonitor::log_state_transition(self.state, next);
        self.state = next;
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(ShutdownSignal::is_requested)
            .unwrap_or(false)
    }

    /// Returns `false` if shutdown interrupted the sleep
    async fn sleep(&mut self, delay: Duration) -> bool {
        match self.shutdown.as_mut() {
            Some(shutdown) => shutdown.sleep(delay).await,
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutboundMessage;
    use crate::testing::mocks::{MockBroker, MockConnector};

    fn params() -> ConnectParams {
        ConnectParams {
            client_id: "greenhouse".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keepalive: Duration::from_secs(30),
            tls: false,
        }
    }

    fn session(broker: &MockBroker) -> Session<MockConnector> {
        Session::new(broker.connector(), params())
    }

    #[test]
    fn test_default_policy_is_half_keepalive_forever() {
        let policy = ReconnectPolicy::from_keepalive(Duration::from_secs(30));
        assert_eq!(policy.retry_delay, Duration::from_secs(15));
        assert_eq!(policy.max_attempts, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_half_keepalive_delay() {
        let broker = MockBroker::new();
        broker.fail_next_connects(2).await;
        let mut session = session(&broker);

        let start = Instant::now();
        session.connect().await.unwrap();

        assert!(session.is_connected());
        assert_eq!(broker.connect_attempts().await, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_with_attempt_cap() {
        let broker = MockBroker::new();
        broker.fail_next_connects(10).await;
        let mut session = session(&broker).with_reconnect_policy(ReconnectPolicy {
            retry_delay: Duration::from_secs(1),
            max_attempts: Some(3),
        });

        let result = session.connect().await;

        assert!(matches!(
            result,
            Err(SessionError::ConnectFailed { attempts: 3, .. })
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_loop_stops_on_shutdown() {
        let broker = MockBroker::new();
        broker.fail_next_connects(u32::MAX).await;
        let (trigger, signal) = crate::shutdown::channel();
        let mut session = session(&broker).with_shutdown(signal);

        let connecting = tokio::spawn(async move { session.connect().await });
        tokio::time::sleep(Duration::from_secs(40)).await;
        trigger.trigger();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(SessionError::ShutdownRequested)));
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_is_deferred() {
        let broker = MockBroker::new();
        let mut session = session(&broker);

        session
            .subscribe("Commands/ALL", DeliveryLevel::AtLeastOnce, |_: &CommandMessage| {
                Vec::<OutboundMessage>::new()
            })
            .await
            .unwrap();

        assert!(broker.active_subscriptions().await.is_empty());

        session.connect().await.unwrap();
        assert_eq!(broker.active_subscriptions().await, vec!["Commands/ALL"]);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_handler() {
        let broker = MockBroker::new();
        let mut session = session(&broker);
        session.connect().await.unwrap();

        session
            .subscribe("Commands/ALL", DeliveryLevel::AtLeastOnce, |_: &CommandMessage| {
                vec![OutboundMessage::new("first", "1", DeliveryLevel::AtMostOnce)]
            })
            .await
            .unwrap();
        session
            .subscribe("Commands/ALL", DeliveryLevel::AtLeastOnce, |_: &CommandMessage| {
                vec![OutboundMessage::new("second", "2", DeliveryLevel::AtMostOnce)]
            })
            .await
            .unwrap();

        assert_eq!(session.subscribed_topics(), vec!["Commands/ALL"]);

        broker.inject("Commands/ALL", "check-in").await;
        let outcome = session.dispatch().await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Handled {
                topic: "Commands/ALL".to_string()
            }
        );
        let topics: Vec<String> = broker.published().await.into_iter().map(|p| p.topic).collect();
        assert_eq!(topics, vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_idle_and_unhandled() {
        let broker = MockBroker::new();
        let mut session = session(&broker);
        session.connect().await.unwrap();
        session
            .subscribe("Commands/ALL", DeliveryLevel::AtLeastOnce, |_: &CommandMessage| {
                Vec::<OutboundMessage>::new()
            })
            .await
            .unwrap();

        assert_eq!(session.dispatch().await.unwrap(), DispatchOutcome::Idle);

        // Delivered by the broker but with no exact-match handler
        broker.inject_unfiltered("Commands/other", "x").await;
        assert_eq!(
            session.dispatch().await.unwrap(),
            DispatchOutcome::Unhandled {
                topic: "Commands/other".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_at_most_once_publish_failure_reports_success() {
        let broker = MockBroker::new();
        let mut session = session(&broker);
        session.connect().await.unwrap();
        broker.fail_next_publish().await;

        let result = session
            .publish("Sensors/a", "x", DeliveryLevel::AtMostOnce, false)
            .await;

        assert!(result.is_ok());
        assert_eq!(session.reconnect_count(), 1);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_at_least_once_publish_failure_reports_not_delivered() {
        let broker = MockBroker::new();
        let mut session = session(&broker);
        session.connect().await.unwrap();
        broker.fail_next_publish().await;

        let result = session
            .publish("Notifications/check-in-reply", "greenhouse", DeliveryLevel::AtLeastOnce, false)
            .await;

        assert!(matches!(result, Err(SessionError::NotDelivered { .. })));
        assert!(session.is_connected());
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_first_connect_through_publish_is_not_a_reconnect() {
        let broker = MockBroker::new();
        let mut session = session(&broker);

        session
            .publish("Sensors/a", "x", DeliveryLevel::AtMostOnce, false)
            .await
            .unwrap();
        assert!(session.is_connected());
        assert_eq!(session.reconnect_count(), 0);

        broker.drop_connection().await;
        assert_eq!(session.dispatch().await.unwrap(), DispatchOutcome::Recovered);
        assert_eq!(session.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_ping_records_timestamp() {
        let broker = MockBroker::new();
        let mut session = session(&broker);
        session.connect().await.unwrap();
        assert!(session.last_ping().is_none());

        session.ping().await.unwrap();

        assert!(session.last_ping().is_some());
        assert_eq!(broker.pings().await, 1);
    }

    #[tokio::test]
    async fn test_poll_failure_recovers() {
        let broker = MockBroker::new();
        let mut session = session(&broker);
        session.connect().await.unwrap();
        broker.fail_next_poll().await;

        assert_eq!(session.dispatch().await.unwrap(), DispatchOutcome::Recovered);
        assert!(session.is_connected());
        assert_eq!(broker.connect_attempts().await, 2);
    }

    #[tokio::test]
    async fn test_health_reflects_connection() {
        let broker = MockBroker::new();
        let mut session = session(&broker);
        assert!(!session.health().is_healthy);

        session.connect().await.unwrap();
        let health = session.health();
        assert!(health.is_healthy);
        assert_eq!(health.reconnect_count, 0);

        session.disconnect().await;
        assert!(!session.health().is_healthy);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
