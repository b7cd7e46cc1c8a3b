use super::*;

#[test]
fn new_sets_fields() {
    let frame = Frame::new("broadcast:cursor", Data::new());
    assert_eq!(frame.syscall, "broadcast:cursor");
    assert!(frame.room_id.is_none());
    assert!(frame.from.is_none());
    assert!(frame.ts > 0);
}

#[test]
fn prefix_and_suffix_extraction() {
    let frame = Frame::new("change:child_pin", Data::new());
    assert_eq!(frame.prefix(), "change");
    assert_eq!(frame.suffix(), "child_pin");

    let frame = Frame::new("noseparator", Data::new());
    assert_eq!(frame.prefix(), "noseparator");
    assert_eq!(frame.suffix(), "");
}

#[test]
fn route_by_prefix() {
    assert_eq!(Frame::new(PRESENCE_SYNC, Data::new()).route(), Route::Presence);
    assert_eq!(Frame::new("broadcast:tool", Data::new()).route(), Route::Broadcast);
    assert_eq!(Frame::new("change:pin", Data::new()).route(), Route::Change);
    assert_eq!(Frame::new("board:join", Data::new()).route(), Route::Unknown);
}

#[test]
fn json_round_trip_keeps_room_and_sender() {
    let original = Frame::new("broadcast:cursor", Data::new())
        .with_room_id("roof-1")
        .with_from("A")
        .with_data("payload", serde_json::json!({ "x": 0.5 }));

    let json = serde_json::to_string(&original).expect("serialize");
    let restored: Frame = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(restored.id, original.id);
    assert_eq!(restored.room_id.as_deref(), Some("roof-1"));
    assert_eq!(restored.from.as_deref(), Some("A"));
    assert_eq!(restored.data.get("payload"), original.data.get("payload"));
}

#[test]
fn room_id_omitted_when_absent() {
    let json = serde_json::to_value(Frame::new("presence:sync", Data::new())).expect("serialize");
    assert!(json.get("room_id").is_none());
}
