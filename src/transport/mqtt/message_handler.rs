//! Pure routing of `rumqttc` events
//!
//! The client drives the event loop and asks this module what each event
//! means. Keeping the classification pure lets it be tested without a broker.

use crate::transport::InboundMessage;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) => {
                    if ack.code == ConnectReturnCode::Success {
                        EventRoute::ConnectionAcknowledged
                    } else {
                        EventRoute::ConnectionRefused(format!("{:?}", ack.code))
                    }
                }
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                }),
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged(ack.pkid),
                Packet::PubComp(comp) => EventRoute::PublishCompleted(comp.pkid),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: Self::subscription_granted(&suback.return_codes),
                },
                Packet::PingResp => EventRoute::PingResponse,
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::PublishSent(*pkid),
                Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent(*pkid),
                Outgoing::PingReq => EventRoute::PingSent,
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// True when every filter in the SUBACK was granted (pure function)
    pub fn subscription_granted(return_codes: &[SubscribeReasonCode]) -> bool {
        !return_codes.is_empty()
            && return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK with success code
    ConnectionAcknowledged,
    /// CONNACK with a refusal code
    ConnectionRefused(String),
    /// Message received on subscribed topic
    MessageReceived(InboundMessage),
    PublishAcknowledged(u16),
    PublishCompleted(u16),
    SubscriptionConfirmed {
        packet_id: u16,
        granted: bool,
    },
    PingResponse,
    /// Broker sent DISCONNECT
    Disconnected,
    PublishSent(u16),
    SubscribeSent(u16),
    PingSent,
    DisconnectSent,
    /// Infrastructure event (UnsubAck, PubRec, etc.)
    InfrastructureEvent(String),
    /// Other outgoing traffic
    OutgoingEvent,
}
