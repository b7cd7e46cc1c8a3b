use super::*;
use crate::types::{Pin, PinStatus};
use serde_json::json;

const T: i64 = 1_700_000_000_000;

fn pin(status: PinStatus, updated_at: i64) -> Pin {
    Pin {
        id: "pin-42".into(),
        x: 0.4,
        y: 0.6,
        status,
        title: Some("Blister at seam".into()),
        severity: None,
        layer_id: None,
        updated_at,
    }
}

fn update(status: PinStatus, updated_at: i64) -> ChangeEvent {
    ChangeEvent::upsert(Entity::Pin(pin(status, updated_at)), false, updated_at)
}

fn cached_status(cache: &EntityCache) -> Option<PinStatus> {
    cache
        .get(EntityType::Pin, "pin-42")
        .and_then(Entity::as_pin)
        .map(|p| p.status)
}

// =============================================================
// Last-write-wins
// =============================================================

#[test]
fn newer_update_wins_in_order() {
    let mut cache = EntityCache::new();
    assert_eq!(cache.apply(&update(PinStatus::ReadyForReview, T - 5_000)), ApplyOutcome::Applied);
    assert_eq!(cache.apply(&update(PinStatus::Closed, T)), ApplyOutcome::Applied);
    assert_eq!(cached_status(&cache), Some(PinStatus::Closed));
}

#[test]
fn stale_update_after_newer_is_ignored() {
    let mut cache = EntityCache::new();
    assert_eq!(cache.apply(&update(PinStatus::Closed, T)), ApplyOutcome::Applied);
    assert_eq!(cache.apply(&update(PinStatus::ReadyForReview, T - 5_000)), ApplyOutcome::Stale);
    assert_eq!(cached_status(&cache), Some(PinStatus::Closed));
}

#[test]
fn reapplying_same_event_is_harmless() {
    let mut cache = EntityCache::new();
    let event = update(PinStatus::Closed, T);
    assert_eq!(cache.apply(&event), ApplyOutcome::Applied);
    assert_eq!(cache.apply(&event), ApplyOutcome::Unchanged);
    assert_eq!(cache.len(), 1);
    assert_eq!(cached_status(&cache), Some(PinStatus::Closed));
}

#[test]
fn insert_is_an_upsert() {
    let mut cache = EntityCache::new();
    cache.apply(&update(PinStatus::Open, T));
    let insert = ChangeEvent::upsert(Entity::Pin(pin(PinStatus::ReadyForInspection, T + 1)), true, T + 1);
    assert_eq!(cache.apply(&insert), ApplyOutcome::Applied);
    assert_eq!(cached_status(&cache), Some(PinStatus::ReadyForInspection));
}

// =============================================================
// Deletes
// =============================================================

#[test]
fn delete_of_absent_entity_is_tolerated() {
    let mut cache = EntityCache::new();
    let delete = ChangeEvent::removal(Entity::Pin(pin(PinStatus::Open, T)), T + 1);
    assert_eq!(cache.apply(&delete), ApplyOutcome::Absent);
    assert!(cache.is_empty());
}

#[test]
fn delete_removes_and_blocks_stale_resurrection() {
    let mut cache = EntityCache::new();
    cache.apply(&update(PinStatus::Open, T));

    let delete = ChangeEvent::removal(Entity::Pin(pin(PinStatus::Open, T)), T + 10);
    assert_eq!(cache.apply(&delete), ApplyOutcome::Removed);
    assert_eq!(cache.tombstone(EntityType::Pin, "pin-42"), Some(T + 10));

    assert_eq!(cache.apply(&update(PinStatus::Closed, T + 5)), ApplyOutcome::Stale);
    assert!(cache.get(EntityType::Pin, "pin-42").is_none());

    assert_eq!(cache.apply(&update(PinStatus::Open, T + 20)), ApplyOutcome::Applied);
    assert!(cache.tombstone(EntityType::Pin, "pin-42").is_none());
}

#[test]
fn delete_older_than_cached_state_is_stale() {
    let mut cache = EntityCache::new();
    cache.apply(&update(PinStatus::Closed, T));
    let delete = ChangeEvent::removal(Entity::Pin(pin(PinStatus::Open, T - 100)), T - 50);
    assert_eq!(cache.apply(&delete), ApplyOutcome::Stale);
    assert!(cache.get(EntityType::Pin, "pin-42").is_some());
}

// =============================================================
// Decode
// =============================================================

#[test]
fn decodes_camel_case_update_payload() {
    let frame = Frame::new("change:pin", Data::new())
        .with_data("operation", "Update")
        .with_data("entityId", "pin-42")
        .with_data("after", json!({ "id": "pin-42", "status": "Closed", "updatedAt": T }))
        .with_data("originUserId", "A");

    let event = decode_change(&frame).expect("decode");
    assert_eq!(event.entity_type(), EntityType::Pin);
    assert_eq!(event.operation(), Operation::Update);
    assert_eq!(event.origin_user_id.as_deref(), Some("A"));
    assert_eq!(event.occurred_at, frame.ts, "occurred_at falls back to frame time");

    let EntityChange::Pin(Change::Update { before, after }) = event.change else {
        panic!("expected pin update");
    };
    assert!(before.is_none());
    assert_eq!(after.status, PinStatus::Closed);
}

#[test]
fn decodes_iso_timestamps_from_hosted_feed() {
    let frame = Frame::new("change:pin", Data::new())
        .with_data("operation", "INSERT")
        .with_data("entity_id", "pin-42")
        .with_data("after", json!({ "id": "pin-42", "status": "Open", "updatedAt": "2023-11-14T22:13:20Z" }))
        .with_data("occurredAt", "2023-11-14T22:13:20.500Z");

    let event = decode_change(&frame).expect("decode");
    assert_eq!(event.change.after_entity().map(|e| e.updated_at()), Some(T));
    assert_eq!(event.occurred_at, T + 500);
}

#[test]
fn encode_decode_preserves_event() {
    let mut event = update(PinStatus::Closed, T);
    event.origin_user_id = Some("B".into());
    let decoded = decode_change(&encode_change(&event)).expect("decode");
    assert_eq!(decoded, event);
}

#[test]
fn decode_errors_are_per_frame() {
    let missing_after = Frame::new("change:pin", Data::new())
        .with_data("operation", "Update")
        .with_data("entity_id", "pin-42");
    let bad_type = Frame::new("change:roof", Data::new())
        .with_data("operation", "Insert")
        .with_data("entity_id", "x");
    let mismatched_id = Frame::new("change:pin", Data::new())
        .with_data("operation", "Insert")
        .with_data("entity_id", "pin-1")
        .with_data("after", json!({ "id": "pin-2", "updated_at": T }));
    let conflicting_type = Frame::new("change:layer", Data::new())
        .with_data("entity_type", "pin")
        .with_data("operation", "Delete")
        .with_data("entity_id", "l1");

    for frame in [missing_after, bad_type, mismatched_id, conflicting_type] {
        let err = decode_change(&frame).expect_err("frame should fail to decode");
        assert_eq!(err.syscall, frame.syscall);
    }
}

#[test]
fn entity_type_may_come_from_payload_alone() {
    let frame = Frame::new("change", Data::new())
        .with_data("entity_type", "child_pin")
        .with_data("operation", "Delete")
        .with_data("entity_id", "c1");
    let event = decode_change(&frame).expect("decode");
    assert_eq!(event.entity_type(), EntityType::ChildPin);
    assert_eq!(event.operation(), Operation::Delete);
}

// =============================================================
// Dispatcher
// =============================================================

#[test]
fn dispatcher_skips_bad_frame_and_keeps_going() {
    let mut dispatcher = ChangeDispatcher::new();
    let bad = Frame::new("change:pin", Data::new()).with_data("operation", "Explode");
    let good = encode_change(&update(PinStatus::Closed, T));

    assert!(dispatcher.handle_frame(&bad).is_err());
    let delivered = dispatcher.handle_frame(&good).expect("good frame decodes");
    assert!(delivered.is_some());
    assert_eq!(cached_status(dispatcher.cache()), Some(PinStatus::Closed));
}

#[test]
fn dispatcher_suppresses_stale_delivery() {
    let mut dispatcher = ChangeDispatcher::new();
    assert!(dispatcher.apply(update(PinStatus::Closed, T)).is_some());
    assert!(dispatcher.apply(update(PinStatus::ReadyForReview, T - 5_000)).is_none());
}
