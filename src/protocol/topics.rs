//! Topic layout of the telemetry wire contract
//!
//! ```text
//! Sensors/<sensor-name>            readings (JSON)
//! Notifications/check-in-reply     check-in answers (plaintext location)
//! Commands/ALL                     broadcast commands
//! Commands/<location>              commands for one device
//! Logs/<location>/Logs             free-text log lines
//! Logs/<location>/Errors           free-text diagnostics
//! ```

use thiserror::Error;

pub const SENSORS_PREFIX: &str = "Sensors";
pub const COMMANDS_BROADCAST: &str = "Commands/ALL";
pub const CHECK_IN_REPLY: &str = "Notifications/check-in-reply";

/// Pure topic construction
pub struct TopicBuilder;

impl TopicBuilder {
    pub fn sensor(name: &str) -> String {
        format!("{SENSORS_PREFIX}/{name}")
    }

    pub fn check_in_reply() -> String {
        CHECK_IN_REPLY.to_string()
    }

    pub fn broadcast_commands() -> String {
        COMMANDS_BROADCAST.to_string()
    }

    pub fn device_commands(location: &str) -> String {
        format!("Commands/{location}")
    }

    pub fn logs(location: &str) -> String {
        format!("Logs/{location}/Logs")
    }

    pub fn errors(location: &str) -> String {
        format!("Logs/{location}/Errors")
    }
}

/// Check that a string can be used as one topic level
pub fn validate_topic_segment(segment: &str) -> Result<(), TopicError> {
    if segment.trim().is_empty() {
        return Err(TopicError::Empty);
    }

    for ch in segment.chars() {
        if matches!(ch, '/' | '+' | '#' | '\0') {
            return Err(TopicError::InvalidChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic segment cannot be empty")]
    Empty,
    #[error("Topic segment contains reserved character: {0:?}")]
    InvalidChar(char),
}
