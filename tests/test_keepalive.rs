//! Cooperative keepalive driven over simulated time
//!
//! The scheduler is ticked the way the controller ticks it: once per
//! sampling iteration. Pings must never be further apart than the keepalive.

mod test_helpers;

use std::time::Duration;
use telemetry_node::commands::CheckInHandler;
use telemetry_node::keepalive::KeepaliveScheduler;
use telemetry_node::session::DispatchOutcome;
use telemetry_node::testing::MockBroker;
use telemetry_node::transport::DeliveryLevel;
use test_helpers::{test_session, KEEPALIVE};
use tokio::time::Instant;

const MARGIN: Duration = Duration::from_secs(5);
const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::test(start_paused = true)]
async fn test_pings_stay_inside_keepalive_window() {
    let broker = MockBroker::new();
    let (_trigger, mut session) = test_session(&broker);
    session.connect().await.unwrap();

    let start = Instant::now();
    let mut scheduler = KeepaliveScheduler::new(KEEPALIVE, MARGIN);
    let mut ping_times = vec![start];

    while start.elapsed() <= Duration::from_secs(300) {
        let outcome = scheduler.tick(&mut session).await.unwrap();
        if outcome.pinged {
            ping_times.push(Instant::now());
        }
        tokio::time::sleep(SAMPLE_INTERVAL).await;
    }

    // First ping at 30s, then every 30s through 300s
    assert_eq!(broker.pings().await, 10);
    assert_eq!(ping_times.len(), 11);
    for pair in ping_times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap <= KEEPALIVE, "pings {gap:?} apart");
        assert!(gap >= scheduler.interval());
    }
    assert!(session.last_ping().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_each_tick_services_one_inbound_message() {
    let broker = MockBroker::new();
    let (_trigger, mut session) = test_session(&broker);
    session.connect().await.unwrap();
    session
        .subscribe(
            "Commands/ALL",
            DeliveryLevel::AtLeastOnce,
            CheckInHandler::new("greenhouse"),
        )
        .await
        .unwrap();

    assert!(broker.inject("Commands/ALL", "check-in").await);
    assert!(broker.inject("Commands/ALL", "check in").await);

    let mut scheduler = KeepaliveScheduler::new(KEEPALIVE, MARGIN);
    let handled = DispatchOutcome::Handled {
        topic: "Commands/ALL".to_string(),
    };

    assert_eq!(scheduler.tick(&mut session).await.unwrap().dispatch, handled);
    assert_eq!(broker.published_to("Notifications/check-in-reply").await.len(), 1);

    assert_eq!(scheduler.tick(&mut session).await.unwrap().dispatch, handled);
    assert_eq!(broker.published_to("Notifications/check-in-reply").await.len(), 2);

    let idle = scheduler.tick(&mut session).await.unwrap();
    assert_eq!(idle.dispatch, DispatchOutcome::Idle);
    assert!(!idle.pinged);
}

#[tokio::test(start_paused = true)]
async fn test_ping_on_dead_link_reconnects() {
    let broker = MockBroker::new();
    let (_trigger, mut session) = test_session(&broker);
    session.connect().await.unwrap();

    let mut scheduler = KeepaliveScheduler::new(KEEPALIVE, MARGIN);
    tokio::time::sleep(scheduler.interval()).await;
    broker.drop_connection().await;

    let outcome = scheduler.tick(&mut session).await.unwrap();

    assert!(outcome.pinged);
    assert!(session.is_connected());
    assert_eq!(session.reconnect_count(), 1);
    assert_eq!(broker.connect_attempts().await, 2);
}
