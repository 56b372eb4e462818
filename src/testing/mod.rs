//! Testing utilities and mock implementations
//!
//! In-memory broker and scripted sensors for exercising the session and the
//! controller without a network or hardware.

pub mod mocks;

pub use mocks::*;
