//! Presence service: who is in the room and what they are doing.
//!
//! DESIGN
//! ======
//! `PresenceMap` is keyed by user id, never by connection, so a user who
//! reconnects replaces their record instead of duplicating it. Merge rules:
//! - `sync` replaces the whole map and is authoritative.
//! - `join` / `leave` patch the map optimistically between syncs.
//! - cursor broadcasts patch the cursor of an existing record only.
//!
//! Wire frames are built here too so the transport and the tracker agree on
//! one encoding.

use std::collections::BTreeMap;

use serde_json::json;

use crate::frame::{Data, Frame, PRESENCE_JOIN, PRESENCE_LEAVE, PRESENCE_SYNC, now_ms};
use crate::types::{Point, PresenceRecord, UserId};

// =============================================================================
// EVENTS
// =============================================================================

/// What presence handlers are told.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Full membership snapshot, delivered on (re)connect and recompute.
    Sync(Vec<PresenceRecord>),
    Join(PresenceRecord),
    Leave(UserId),
    /// A peer's cursor moved (merged from the broadcast bus).
    Cursor { user_id: UserId, position: Point },
}

/// Decoded presence frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceFrame {
    Sync(Vec<PresenceRecord>),
    Join(PresenceRecord),
    Leave(UserId),
}

// =============================================================================
// PRESENCE MAP
// =============================================================================

#[derive(Debug, Clone)]
pub struct PresenceMap {
    local_user: UserId,
    records: BTreeMap<UserId, PresenceRecord>,
}

impl PresenceMap {
    pub fn new(local_user: impl Into<UserId>) -> Self {
        Self { local_user: local_user.into(), records: BTreeMap::new() }
    }

    /// Replace everything with an authoritative snapshot. Later entries for
    /// the same user win.
    pub fn apply_sync(&mut self, records: Vec<PresenceRecord>) {
        self.records = records
            .into_iter()
            .map(|r| (r.user_id.clone(), r))
            .collect();
    }

    /// Upsert one record. Returns `true` if the user was not present before.
    pub fn apply_join(&mut self, record: PresenceRecord) -> bool {
        self.records
            .insert(record.user_id.clone(), record)
            .is_none()
    }

    /// Remove a user. Absent users are ignored.
    pub fn apply_leave(&mut self, user_id: &str) -> Option<PresenceRecord> {
        self.records.remove(user_id)
    }

    /// Patch the cursor of an existing record. Unknown users are ignored
    /// until a sync or join introduces them.
    pub fn merge_cursor(&mut self, user_id: &str, position: Point, seen_at: i64) -> bool {
        let Some(record) = self.records.get_mut(user_id) else {
            return false;
        };
        record.cursor = Some(position.clamped());
        record.last_seen = record.last_seen.max(seen_at);
        true
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    /// Every record, ordered by user id.
    #[must_use]
    pub fn all(&self) -> Vec<PresenceRecord> {
        self.records.values().cloned().collect()
    }

    /// Every record except the local user's.
    #[must_use]
    pub fn others(&self) -> Vec<PresenceRecord> {
        self.records
            .values()
            .filter(|r| r.user_id != self.local_user)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Presence state owned by a room task: the shared map plus the local
/// user's own record, which is re-published after every reconnect.
#[derive(Debug)]
pub struct PresenceTracker {
    local_user: UserId,
    map: PresenceMap,
    own: Option<PresenceRecord>,
}

impl PresenceTracker {
    pub fn new(local_user: impl Into<UserId>) -> Self {
        let local_user = local_user.into();
        Self { map: PresenceMap::new(local_user.clone()), local_user, own: None }
    }

    /// Normalize a record the local user wants to publish: stamp identity
    /// and `last_seen`, clamp the cursor. The result is remembered.
    pub fn prepare_track(&mut self, mut record: PresenceRecord) -> PresenceRecord {
        record.user_id.clone_from(&self.local_user);
        record.last_seen = now_ms();
        record.cursor = record.cursor.map(Point::clamped);
        self.own = Some(record.clone());
        record
    }

    pub fn clear_own(&mut self) {
        self.own = None;
    }

    #[must_use]
    pub fn own(&self) -> Option<&PresenceRecord> {
        self.own.as_ref()
    }

    #[must_use]
    pub fn map(&self) -> &PresenceMap {
        &self.map
    }

    /// Apply a decoded presence frame and describe what changed.
    pub fn apply(&mut self, frame: PresenceFrame) -> PresenceEvent {
        match frame {
            PresenceFrame::Sync(records) => {
                self.map.apply_sync(records);
                PresenceEvent::Sync(self.map.all())
            }
            PresenceFrame::Join(record) => {
                self.map.apply_join(record.clone());
                PresenceEvent::Join(record)
            }
            PresenceFrame::Leave(user_id) => {
                self.map.apply_leave(&user_id);
                PresenceEvent::Leave(user_id)
            }
        }
    }

    /// Merge a peer cursor. Returns the event to emit when it landed.
    pub fn merge_cursor(&mut self, user_id: &str, position: Point, seen_at: i64) -> Option<PresenceEvent> {
        if user_id == self.local_user {
            return None;
        }
        self.map
            .merge_cursor(user_id, position, seen_at)
            .then(|| PresenceEvent::Cursor { user_id: user_id.to_owned(), position: position.clamped() })
    }
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

#[must_use]
pub fn encode_sync(records: &[PresenceRecord]) -> Frame {
    Frame::new(PRESENCE_SYNC, Data::new()).with_data("users", json!(records))
}

#[must_use]
pub fn encode_join(record: &PresenceRecord) -> Frame {
    Frame::new(PRESENCE_JOIN, Data::new())
        .with_from(record.user_id.clone())
        .with_data("record", json!(record))
}

#[must_use]
pub fn encode_leave(user_id: &str) -> Frame {
    Frame::new(PRESENCE_LEAVE, Data::new())
        .with_from(user_id)
        .with_data("user_id", user_id)
}

/// Decode a `presence:*` frame.
///
/// # Errors
///
/// Returns a description of the problem when the syscall is unknown or the
/// payload does not match it.
pub fn decode(frame: &Frame) -> Result<PresenceFrame, String> {
    match frame.syscall.as_str() {
        PRESENCE_SYNC => {
            let users = frame.data.get("users").cloned().unwrap_or(json!([]));
            serde_json::from_value(users)
                .map(PresenceFrame::Sync)
                .map_err(|e| format!("invalid sync payload: {e}"))
        }
        PRESENCE_JOIN => {
            let record = frame
                .data
                .get("record")
                .cloned()
                .ok_or_else(|| "join without record".to_owned())?;
            serde_json::from_value(record)
                .map(PresenceFrame::Join)
                .map_err(|e| format!("invalid join payload: {e}"))
        }
        PRESENCE_LEAVE => frame
            .data
            .get("user_id")
            .and_then(|v| v.as_str())
            .map(|u| PresenceFrame::Leave(u.to_owned()))
            .ok_or_else(|| "leave without user_id".to_owned()),
        other => Err(format!("unknown presence syscall: {other}")),
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
