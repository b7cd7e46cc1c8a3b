use super::*;

const BASE: Duration = Duration::from_millis(1000);
const MAX: Duration = Duration::from_millis(10_000);

fn controller() -> ReconnectController {
    ReconnectController::new(BASE, MAX)
}

// =============================================================
// backoff_delay
// =============================================================

#[test]
fn backoff_doubles_then_caps() {
    let delays: Vec<u64> = (0..6)
        .map(|a| u64::try_from(backoff_delay(BASE, MAX, a).as_millis()).unwrap())
        .collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
}

#[test]
fn backoff_saturates_for_huge_attempts() {
    assert_eq!(backoff_delay(BASE, MAX, 31), MAX);
    assert_eq!(backoff_delay(BASE, MAX, 64), MAX);
    assert_eq!(backoff_delay(BASE, MAX, u32::MAX), MAX);
}

// =============================================================
// ReconnectController
// =============================================================

#[test]
fn happy_path_reaches_connected() {
    let mut c = controller();
    assert_eq!(c.state(), ConnectionState::Idle);
    assert_eq!(
        c.handle(ControllerEvent::Subscribe),
        Some((ConnectionState::Idle, ConnectionState::Connecting))
    );
    c.handle(ControllerEvent::TransportSubscribed);
    assert_eq!(c.state(), ConnectionState::Connected);
    assert_eq!(c.attempt(), 0);
}

#[test]
fn repeated_failures_grow_the_delay() {
    let mut c = controller();
    c.handle(ControllerEvent::Subscribe);

    let mut seen = Vec::new();
    for _ in 0..3 {
        c.handle(ControllerEvent::TransportError);
        assert_eq!(c.state(), ConnectionState::Backoff);
        seen.push(c.delay());
        c.handle(ControllerEvent::BackoffElapsed);
        assert_eq!(c.state(), ConnectionState::Connecting);
    }
    assert_eq!(seen, vec![BASE, BASE * 2, BASE * 4]);
    assert_eq!(c.attempt(), 3);
}

#[test]
fn connecting_resets_attempt() {
    let mut c = controller();
    c.handle(ControllerEvent::Subscribe);
    c.handle(ControllerEvent::TransportError);
    c.handle(ControllerEvent::BackoffElapsed);
    c.handle(ControllerEvent::TransportError);
    c.handle(ControllerEvent::BackoffElapsed);
    assert_eq!(c.attempt(), 2);

    c.handle(ControllerEvent::TransportSubscribed);
    assert_eq!(c.attempt(), 0);
    c.handle(ControllerEvent::ConnectivityLost);
    assert_eq!(c.delay(), BASE);
}

#[test]
fn connectivity_restored_skips_backoff_but_is_noop_when_connected() {
    let mut c = controller();
    c.handle(ControllerEvent::Subscribe);
    c.handle(ControllerEvent::TransportSubscribed);
    assert_eq!(c.handle(ControllerEvent::ConnectivityRestored), None);
    assert_eq!(c.state(), ConnectionState::Connected);

    c.handle(ControllerEvent::ConnectivityLost);
    assert_eq!(c.state(), ConnectionState::Backoff);
    c.handle(ControllerEvent::ConnectivityRestored);
    assert_eq!(c.state(), ConnectionState::Connecting);
}

#[test]
fn unsubscribe_and_fatal_are_terminal() {
    for terminal in [ControllerEvent::Unsubscribe, ControllerEvent::Fatal] {
        let mut c = controller();
        c.handle(ControllerEvent::Subscribe);
        c.handle(ControllerEvent::TransportError);
        c.handle(terminal);
        assert_eq!(c.state(), ConnectionState::Disconnected);

        for event in [
            ControllerEvent::Subscribe,
            ControllerEvent::BackoffElapsed,
            ControllerEvent::ConnectivityRestored,
            ControllerEvent::TransportSubscribed,
        ] {
            assert_eq!(c.handle(event), None);
        }
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }
}

#[test]
fn stray_events_are_ignored() {
    let mut c = controller();
    assert_eq!(c.handle(ControllerEvent::TransportSubscribed), None);
    assert_eq!(c.handle(ControllerEvent::BackoffElapsed), None);
    assert_eq!(c.state(), ConnectionState::Idle);

    c.handle(ControllerEvent::Subscribe);
    assert_eq!(c.handle(ControllerEvent::Subscribe), None);
}

// =============================================================
// RoomStatus
// =============================================================

#[test]
fn status_mapping() {
    assert_eq!(status_for(ConnectionState::Idle, false), SubscriptionStatus::Connecting);
    assert_eq!(status_for(ConnectionState::Connecting, false), SubscriptionStatus::Connecting);
    assert_eq!(status_for(ConnectionState::Connected, false), SubscriptionStatus::Subscribed);
    assert_eq!(status_for(ConnectionState::Backoff, false), SubscriptionStatus::Error);
    assert_eq!(status_for(ConnectionState::Disconnected, false), SubscriptionStatus::Disconnected);
    assert_eq!(status_for(ConnectionState::Disconnected, true), SubscriptionStatus::Error);
}

#[test]
fn settled_statuses() {
    let connecting = RoomStatus { status: SubscriptionStatus::Connecting, state: ConnectionState::Connecting, ..RoomStatus::default() };
    assert!(!connecting.is_settled());

    let subscribed = RoomStatus { status: SubscriptionStatus::Subscribed, state: ConnectionState::Connected, ..RoomStatus::default() };
    assert!(subscribed.is_settled());

    let first_failure = RoomStatus { status: SubscriptionStatus::Error, state: ConnectionState::Backoff, ..RoomStatus::default() };
    assert!(first_failure.is_settled());

    let reconnecting = RoomStatus {
        status: SubscriptionStatus::Connecting,
        state: ConnectionState::Connecting,
        ever_connected: true,
        ..RoomStatus::default()
    };
    assert!(reconnecting.is_settled(), "a room that connected before answers during retries");

    let closed = RoomStatus { status: SubscriptionStatus::Disconnected, state: ConnectionState::Disconnected, ..RoomStatus::default() };
    assert!(closed.is_settled());
}
