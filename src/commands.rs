//! Inbound command handlers
//!
//! Handlers are plain synchronous functions of the command: they inspect the
//! message and return the replies the session should publish. Any
//! `FnMut(&CommandMessage) -> Vec<OutboundMessage>` closure is a handler.

use crate::protocol::{CommandMessage, OutboundMessage, TopicBuilder};
use crate::transport::DeliveryLevel;
use tracing::{debug, info};

/// Something that reacts to commands on a subscribed topic
pub trait CommandHandler: Send {
    fn handle(&mut self, command: &CommandMessage) -> Vec<OutboundMessage>;
}

impl<F> CommandHandler for F
where
    F: FnMut(&CommandMessage) -> Vec<OutboundMessage> + Send,
{
    fn handle(&mut self, command: &CommandMessage) -> Vec<OutboundMessage> {
        self(command)
    }
}

/// Payloads that ask the device to report in
const CHECK_IN_PAYLOADS: [&str; 2] = ["check-in", "check in"];

/// Answers `check-in` with the device location on `Notifications/check-in-reply`
#[derive(Debug, Clone)]
pub struct CheckInHandler {
    location: String,
}

impl CheckInHandler {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }

    pub fn is_check_in(payload: &str) -> bool {
        CHECK_IN_PAYLOADS.contains(&payload)
    }
}

impl CommandHandler for CheckInHandler {
    fn handle(&mut self, command: &CommandMessage) -> Vec<OutboundMessage> {
        let text = command.text();
        if !Self::is_check_in(&text) {
            debug!(topic = %command.topic, payload = %text, "Ignoring unknown command");
            return Vec::new();
        }

        info!(topic = %command.topic, location = %self.location, "Check-in requested");
        vec![OutboundMessage::new(
            TopicBuilder::check_in_reply(),
            self.location.clone(),
            DeliveryLevel::AtLeastOnce,
        )]
    }
}
