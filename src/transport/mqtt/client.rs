//! Impure I/O operations for the MQTT transport
//!
//! This module drives the `rumqttc` event loop on the caller's task. There is
//! no background task: every publish, subscribe, ping and poll services the
//! event loop until the packet it is waiting for shows up, queueing any
//! inbound publishes it meets along the way.

use super::connection::{configure_mqtt_options, qos_for, MqttTimeouts, REQUEST_CHANNEL_CAPACITY};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{
    ConnectParams, Connector, DeliveryLevel, InboundMessage, Transport, TransportError,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, PingReq, Request};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use crate::mqtt_span;
use tracing::{debug, info, warn, Instrument};

/// Opens `rumqttc` connections
#[derive(Debug, Clone, Default)]
pub struct MqttConnector {
    timeouts: MqttTimeouts,
}

impl MqttConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(timeouts: MqttTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Transport = MqttTransport;

    async fn connect(&mut self, params: &ConnectParams) -> Result<MqttTransport, TransportError> {
        let mqtt_options = configure_mqtt_options(params);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let mut transport = MqttTransport {
            client,
            event_loop,
            inbound: VecDeque::new(),
            timeouts: self.timeouts.clone(),
        };

        debug!(host = %params.host, port = params.port, "Waiting for CONNACK");

        transport
            .drive_until(self.timeouts.connect, "CONNACK", |route| match route {
                EventRoute::ConnectionAcknowledged => Ok(true),
                EventRoute::ConnectionRefused(reason) => {
                    Err(TransportError::Refused(reason.clone()))
                }
                _ => Ok(false),
            })
            .instrument(mqtt_span!(operation = "connect", client_id = %params.client_id))
            .await
            .map_err(|error| match error {
                // Nothing was established yet, so a lost link is a failed connect
                TransportError::ConnectionLost(reason) => TransportError::ConnectionFailed(reason),
                other => other,
            })?;

        info!(
            client_id = %params.client_id,
            host = %params.host,
            port = params.port,
            "MQTT connection acknowledged"
        );
        Ok(transport)
    }
}

/// One live `rumqttc` connection
pub struct MqttTransport {
    client: AsyncClient,
    event_loop: EventLoop,
    inbound: VecDeque<InboundMessage>,
    timeouts: MqttTimeouts,
}

impl MqttTransport {
    /// Service the event loop until `done` accepts a routed event.
    ///
    /// Inbound publishes are queued before `done` sees them. A broker
    /// DISCONNECT or an event loop error ends the wait with `ConnectionLost`.
    async fn drive_until<F>(
        &mut self,
        limit: Duration,
        waiting_for: &'static str,
        mut done: F,
    ) -> Result<(), TransportError>
    where
        F: FnMut(&EventRoute) -> Result<bool, TransportError> + Send,
    {
        let deadline = Instant::now() + limit;

        loop {
            let event = match tokio::time::timeout_at(deadline, self.event_loop.poll()).await {
                Err(_) => return Err(TransportError::Timeout(waiting_for)),
                Ok(Err(error)) => return Err(map_connection_error(error)),
                Ok(Ok(event)) => event,
            };

            let route = MessageHandler::route_mqtt_event(&event);
            match &route {
                EventRoute::MessageReceived(message) => {
                    debug!(topic = %message.topic, bytes = message.payload.len(), "Inbound message queued");
                    self.inbound.push_back(message.clone());
                }
                EventRoute::Disconnected => {
                    warn!("Broker sent DISCONNECT");
                    return Err(TransportError::ConnectionLost(
                        "broker closed the session".to_string(),
                    ));
                }
                EventRoute::InfrastructureEvent(packet) => {
                    debug!(packet = %packet, "Infrastructure event");
                }
                _ => {}
            }

            if done(&route)? {
                return Ok(());
            }
        }
    }
}

/// Map an event loop failure onto the transport error space (pure function)
fn map_connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{code:?}")),
        other => TransportError::ConnectionLost(other.to_string()),
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos_for(level), retain, payload)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))?;

        let waiting_for = match level {
            DeliveryLevel::AtMostOnce => "PUBLISH flush",
            DeliveryLevel::AtLeastOnce => "PUBACK",
            DeliveryLevel::ExactlyOnce => "PUBCOMP",
        };

        let mut sent_pkid: Option<u16> = None;
        let limit = self.timeouts.ack;
        self.drive_until(limit, waiting_for, |route| {
            Ok(match route {
                EventRoute::PublishSent(pkid) if sent_pkid.is_none() => {
                    sent_pkid = Some(*pkid);
                    !level.is_acknowledged()
                }
                EventRoute::PublishAcknowledged(pkid) => {
                    level == DeliveryLevel::AtLeastOnce && sent_pkid == Some(*pkid)
                }
                EventRoute::PublishCompleted(pkid) => {
                    level == DeliveryLevel::ExactlyOnce && sent_pkid == Some(*pkid)
                }
                _ => false,
            })
        })
        .await?;

        debug!(topic = %topic, ?level, pkid = ?sent_pkid, "Publish complete");
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, level: DeliveryLevel) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, qos_for(level))
            .await
            .map_err(|e| TransportError::Client(e.to_string()))?;

        let mut sent_pkid: Option<u16> = None;
        let rejected_topic = topic.to_string();
        let limit = self.timeouts.ack;
        self.drive_until(limit, "SUBACK", |route| match route {
            EventRoute::SubscribeSent(pkid) if sent_pkid.is_none() => {
                sent_pkid = Some(*pkid);
                Ok(false)
            }
            EventRoute::SubscriptionConfirmed { packet_id, granted } if sent_pkid == Some(*packet_id) => {
                if *granted {
                    Ok(true)
                } else {
                    Err(TransportError::Rejected(rejected_topic.clone()))
                }
            }
            _ => Ok(false),
        })
        .await?;

        debug!(topic = %topic, ?level, "Subscription confirmed");
        Ok(())
    }

    /// Send PINGREQ now and wait for PINGRESP; a missing response is a `Timeout`.
    ///
    /// The request goes on the event loop's pending queue, which is drained
    /// before the client request channel.
    async fn ping(&mut self) -> Result<(), TransportError> {
        self.event_loop.pending.push_back(Request::PingReq(PingReq));

        let limit = self.timeouts.ack;
        self.drive_until(limit, "PINGRESP", |route| {
            Ok(matches!(route, EventRoute::PingResponse))
        })
        .await?;

        debug!("PINGRESP received");
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        if let Some(message) = self.inbound.pop_front() {
            return Ok(Some(message));
        }

        let limit = self.timeouts.poll;
        match self
            .drive_until(limit, "inbound message", |route| {
                Ok(matches!(route, EventRoute::MessageReceived(_)))
            })
            .await
        {
            Ok(()) => Ok(self.inbound.pop_front()),
            Err(TransportError::Timeout(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Client(e.to_string()))?;

        let limit = self.timeouts.disconnect;
        self.drive_until(limit, "DISCONNECT flush", |route| {
            Ok(matches!(route, EventRoute::DisconnectSent))
        })
        .await?;

        info!("MQTT connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::ConnectReturnCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT: u8 = 0x10;
    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const PUBLISH_QOS1: u8 = 0x32;
    const SUBSCRIBE: u8 = 0x82;
    const PINGREQ: u8 = 0xC0;
    const PINGRESP: [u8; 2] = [0xD0, 0x00];

    fn params_for(port: u16) -> ConnectParams {
        ConnectParams {
            client_id: "test-node".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            username: None,
            password: None,
            keepalive: Duration::from_secs(30),
            tls: false,
        }
    }

    fn test_timeouts() -> MqttTimeouts {
        MqttTimeouts {
            connect: Duration::from_secs(5),
            ack: Duration::from_millis(500),
            poll: Duration::from_secs(2),
            disconnect: Duration::from_secs(1),
        }
    }

    /// Read one MQTT control packet: fixed header byte and body
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;

        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accept one client and complete the CONNECT/CONNACK exchange
    async fn accept_client(listener: TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header, CONNECT);
        stream.write_all(&CONNACK_ACCEPTED).await.unwrap();
        stream
    }

    async fn loopback_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn connect_to(port: u16) -> MqttTransport {
        MqttConnector::with_timeouts(test_timeouts())
            .connect(&params_for(port))
            .await
            .unwrap()
    }

    /// Topic of a PUBLISH or the first filter of a SUBSCRIBE, starting at `offset`
    fn topic_at(body: &[u8], offset: usize) -> (String, usize) {
        let len = usize::from(u16::from_be_bytes([body[offset], body[offset + 1]]));
        let start = offset + 2;
        let topic = String::from_utf8(body[start..start + len].to_vec()).unwrap();
        (topic, start + len)
    }

    #[test]
    fn test_map_refused_connection() {
        let error = map_connection_error(ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword,
        ));
        assert!(matches!(error, TransportError::Refused(reason) if reason.contains("BadUserNamePassword")));
    }

    #[test]
    fn test_map_io_error_is_connection_lost() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let error = map_connection_error(ConnectionError::Io(io));
        assert!(matches!(error, TransportError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let mut connector = MqttConnector::with_timeouts(MqttTimeouts {
            connect: Duration::from_secs(2),
            ..MqttTimeouts::default()
        });

        // Port 1 on loopback is closed on any sane test host
        let result = connector.connect(&params_for(1)).await;

        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed(_)) | Err(TransportError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_by_broker() {
        let (listener, port) = loopback_listener().await;
        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_packet(&mut stream).await.unwrap();
            // Return code 5: not authorized
            stream.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
            stream
        });

        let result = MqttConnector::with_timeouts(test_timeouts())
            .connect(&params_for(port))
            .await;

        assert!(matches!(result, Err(TransportError::Refused(_))));
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_sends_pingreq_and_waits_for_pingresp() {
        let (listener, port) = loopback_listener().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_client(listener).await;
            let (header, _) = read_packet(&mut stream).await.unwrap();
            stream.write_all(&PINGRESP).await.unwrap();
            (header, stream)
        });

        let mut transport = connect_to(port).await;
        transport.ping().await.unwrap();

        let (header, _stream) = broker.await.unwrap();
        assert_eq!(header, PINGREQ);
    }

    #[tokio::test]
    async fn test_missing_pingresp_is_timeout() {
        let (listener, port) = loopback_listener().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_client(listener).await;
            let (header, _) = read_packet(&mut stream).await.unwrap();
            // Hold the link open without answering
            tokio::time::sleep(Duration::from_secs(2)).await;
            header
        });

        let mut transport = connect_to(port).await;
        let result = transport.ping().await;

        assert!(matches!(result, Err(TransportError::Timeout("PINGRESP"))));
        assert_eq!(broker.await.unwrap(), PINGREQ);
    }

    #[tokio::test]
    async fn test_at_least_once_publish_completes_on_puback() {
        let (listener, port) = loopback_listener().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_client(listener).await;
            let (header, body) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header, PUBLISH_QOS1);

            let (topic, pkid_at) = topic_at(&body, 0);
            let pkid = [body[pkid_at], body[pkid_at + 1]];
            let payload = body[pkid_at + 2..].to_vec();
            stream
                .write_all(&[0x40, 0x02, pkid[0], pkid[1]])
                .await
                .unwrap();
            (topic, payload, stream)
        });

        let mut transport = connect_to(port).await;
        transport
            .publish(
                "Notifications/check-in-reply",
                b"greenhouse".to_vec(),
                DeliveryLevel::AtLeastOnce,
                false,
            )
            .await
            .unwrap();

        let (topic, payload, _stream) = broker.await.unwrap();
        assert_eq!(topic, "Notifications/check-in-reply");
        assert_eq!(payload, b"greenhouse".to_vec());
    }

    #[tokio::test]
    async fn test_subscribe_completes_on_suback() {
        let (listener, port) = loopback_listener().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_client(listener).await;
            let (header, body) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header, SUBSCRIBE);

            let (topic, _) = topic_at(&body, 2);
            // Granted at QoS 1
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x01])
                .await
                .unwrap();
            (topic, stream)
        });

        let mut transport = connect_to(port).await;
        transport
            .subscribe("Commands/ALL", DeliveryLevel::AtLeastOnce)
            .await
            .unwrap();

        let (topic, _stream) = broker.await.unwrap();
        assert_eq!(topic, "Commands/ALL");
    }

    #[tokio::test]
    async fn test_subscribe_rejected_by_broker() {
        let (listener, port) = loopback_listener().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_client(listener).await;
            let (_, body) = read_packet(&mut stream).await.unwrap();
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x80])
                .await
                .unwrap();
            stream
        });

        let mut transport = connect_to(port).await;
        let result = transport
            .subscribe("Commands/ALL", DeliveryLevel::AtLeastOnce)
            .await;

        assert!(matches!(result, Err(TransportError::Rejected(topic)) if topic == "Commands/ALL"));
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_inbound_publish_is_returned_by_poll() {
        let (listener, port) = loopback_listener().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_client(listener).await;

            let topic = b"Commands/ALL";
            let payload = b"check-in";
            let remaining = (2 + topic.len() + payload.len()) as u8;
            let mut packet = vec![0x30, remaining, 0x00, topic.len() as u8];
            packet.extend_from_slice(topic);
            packet.extend_from_slice(payload);
            stream.write_all(&packet).await.unwrap();

            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        let mut transport = connect_to(port).await;
        let message = transport.poll().await.unwrap().unwrap();

        assert_eq!(message.topic, "Commands/ALL");
        assert_eq!(message.payload, b"check-in".to_vec());
        assert!(!message.retain);
        broker.abort();
    }
}
