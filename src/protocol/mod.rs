//! Wire contract of the telemetry node
//!
//! Topic layout and the messages carried on it.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
