//! Cooperative keepalive
//!
//! There is no keepalive task. The controller calls [`KeepaliveScheduler::tick`]
//! once per iteration; the scheduler pings when the check-in interval has
//! elapsed and always services one inbound message.

use crate::session::{DispatchOutcome, Session, SessionError};
use crate::transport::Connector;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub pinged: bool,
    pub dispatch: DispatchOutcome,
}

/// Holds the last ping time and the check-in interval
#[derive(Debug, Clone)]
pub struct KeepaliveScheduler {
    last_ping: Instant,
    interval: Duration,
}

impl KeepaliveScheduler {
    /// Check-in interval is `keepalive - margin`; the clock starts now
    pub fn new(keepalive: Duration, margin: Duration) -> Self {
        Self::starting_at(Instant::now(), keepalive.saturating_sub(margin))
    }

    pub fn starting_at(now: Instant, interval: Duration) -> Self {
        Self {
            last_ping: now,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_ping(&self) -> Instant {
        self.last_ping
    }

    pub fn is_ping_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ping) >= self.interval
    }

    /// Consume a due ping: returns `true` and restarts the interval at `now`
    pub fn take_due(&mut self, now: Instant) -> bool {
        if self.is_ping_due(now) {
            self.last_ping = now;
            true
        } else {
            false
        }
    }

    pub async fn tick<C: Connector>(
        &mut self,
        session: &mut Session<C>,
    ) -> Result<TickOutcome, SessionError> {
        self.tick_at(Instant::now(), session).await
    }

    /// Ping if due at `now`, then dispatch one inbound message
    pub async fn tick_at<C: Connector>(
        &mut self,
        now: Instant,
        session: &mut Session<C>,
    ) -> Result<TickOutcome, SessionError> {
        let pinged = self.take_due(now);
        if pinged {
            session.ping().await?;
        }

        let dispatch = session.dispatch().await?;
        Ok(TickOutcome { pinged, dispatch })
    }
}
