//! Process-wide shutdown flag
//!
//! A `watch` channel carries a single boolean. The signal listener in the
//! binary owns the [`ShutdownTrigger`]; the session and the controller hold
//! [`ShutdownSignal`] clones and observe it at their sleep points.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Sending half; flipping it is irreversible
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cheap to clone
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `delay` unless shutdown is requested first.
    ///
    /// Returns `true` when the full delay elapsed, `false` when interrupted.
    /// A dropped trigger can never fire, so the sleep then runs to completion.
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        if self.is_requested() {
            return false;
        }

        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep_until(deadline).await;
                        return true;
                    }
                    if *self.rx.borrow_and_update() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_trigger() {
        let (_trigger, mut signal) = channel();

        let start = Instant::now();
        assert!(signal.sleep(Duration::from_secs(10)).await);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_trigger() {
        let (trigger, mut signal) = channel();

        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();

        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_immediately_when_already_requested() {
        let (trigger, mut signal) = channel();
        trigger.trigger();

        let start = Instant::now();
        assert!(!signal.sleep(Duration::from_secs(60)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(signal.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trigger_finishes_sleep() {
        let (trigger, mut signal) = channel();
        drop(trigger);

        assert!(signal.sleep(Duration::from_secs(5)).await);
        assert!(!signal.is_requested());
    }

    #[test]
    fn test_subscribe_sees_trigger() {
        let (trigger, _signal) = channel();
        let late = trigger.subscribe();
        trigger.trigger();
        assert!(late.is_requested());
    }
}
