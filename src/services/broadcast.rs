//! Broadcast bus: ephemeral pub/sub over the room channel.
//!
//! DESIGN
//! ======
//! Broadcasts are hints: at-most-once, never persisted, never retried. A
//! message travels as a `broadcast:<topic>` frame whose `from` is the sender
//! and whose `ts` is the send time. Per sender and topic, order is whatever
//! the single room task enqueued; nothing is promised across senders.
//!
//! Cursor broadcasts double as presence patches: the room task feeds the
//! decoded position into the presence tracker.

use serde_json::Value;

use crate::frame::{Data, Frame, PREFIX_BROADCAST};
use crate::types::{BroadcastMessage, Point};

/// Topic whose payload is merged into the sender's presence record.
pub const TOPIC_CURSOR: &str = "cursor";

#[must_use]
pub fn syscall_for(topic: &str) -> String {
    format!("{PREFIX_BROADCAST}:{topic}")
}

/// Build the outbound frame for a broadcast.
#[must_use]
pub fn encode(topic: &str, payload: Value, sender_id: &str) -> Frame {
    Frame::new(syscall_for(topic), Data::new())
        .with_from(sender_id)
        .with_data("payload", payload)
}

/// Decode an inbound `broadcast:<topic>` frame.
///
/// # Errors
///
/// Returns a description when the topic or sender is missing.
pub fn decode(frame: &Frame) -> Result<BroadcastMessage, String> {
    let topic = frame.suffix();
    if topic.is_empty() {
        return Err("broadcast without topic".into());
    }
    let Some(sender_id) = frame.from.clone() else {
        return Err(format!("broadcast on {topic} without sender"));
    };
    Ok(BroadcastMessage {
        topic: topic.to_owned(),
        payload: frame.data.get("payload").cloned().unwrap_or(Value::Null),
        sender_id,
        sent_at: frame.ts,
    })
}

/// Extract a cursor position from a `{ "x": .., "y": .. }` payload.
#[must_use]
pub fn cursor_position(payload: &Value) -> Option<Point> {
    let x = payload.get("x")?.as_f64()?;
    let y = payload.get("y")?.as_f64()?;
    Some(Point::new(x, y).clamped())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_then_decode_keeps_topic_sender_and_time() {
        let frame = encode("tool", json!({ "tool": "pin" }), "A");
        assert_eq!(frame.syscall, "broadcast:tool");

        let msg = decode(&frame).expect("decode");
        assert_eq!(msg.topic, "tool");
        assert_eq!(msg.sender_id, "A");
        assert_eq!(msg.sent_at, frame.ts);
        assert_eq!(msg.payload, json!({ "tool": "pin" }));
    }

    #[test]
    fn decode_requires_sender() {
        let mut frame = encode("tool", json!(null), "A");
        frame.from = None;
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn decode_requires_topic() {
        let frame = Frame::new("broadcast", Data::new()).with_from("A");
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn cursor_position_parses_and_clamps() {
        assert_eq!(cursor_position(&json!({ "x": 0.25, "y": 3 })), Some(Point::new(0.25, 1.0)));
        assert_eq!(cursor_position(&json!({ "x": "left" })), None);
        assert_eq!(cursor_position(&json!(null)), None);
    }
}
