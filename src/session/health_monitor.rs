//! Pure health monitoring and reconnection logic for the session
//!
//! This module contains pure functions for reconnection decision making,
//! connection state tracking and health assessment.

use super::{ConnectionState, ReconnectPolicy};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what happens after `failed_attempts` consecutive failed connects (pure function)
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        failed_attempts: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = policy.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: failed_attempts + 1,
            delay: policy.retry_delay,
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT session established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("MQTT session lost");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                warn!("MQTT connect attempt failed");
            }
            (from, to) if from == to => {}
            (from, to) => {
                info!("MQTT session state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Calculate health metrics for the session (pure function)
    pub fn calculate_health_metrics(
        now: Instant,
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        last_activity: Option<Instant>,
        reconnect_count: u32,
        stale_after: Duration,
    ) -> HealthMetrics {
        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.duration_since(t));
        let time_since_last_activity = last_activity.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            time_since_last_activity,
            reconnect_count,
            is_healthy: Self::determine_health_status(
                uptime,
                time_since_last_activity,
                stale_after,
            ),
        }
    }

    /// Determine overall health status (pure function)
    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_activity: Option<Duration>,
        stale_after: Duration,
    ) -> bool {
        // Commands are rare, so health follows any successful exchange rather than inbound traffic
        match (uptime, time_since_last_activity) {
            (Some(_), None) => true,
            (Some(_), Some(idle)) => idle < stale_after,
            _ => false,
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Sleep for `delay`, then make connect attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Time since the last inbound command
    pub time_since_last_message: Option<Duration>,
    /// Time since the last successful exchange with the broker
    pub time_since_last_activity: Option<Duration>,
    /// Number of reconnects since start
    pub reconnect_count: u32,
    pub is_healthy: bool,
}
