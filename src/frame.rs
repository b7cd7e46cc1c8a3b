//! Frame: the wire envelope for everything that crosses a room channel.
//!
//! ARCHITECTURE
//! ============
//! Presence updates, broadcasts and change-feed notifications all arrive as
//! Frames. The room task routes on the `syscall` prefix and never inspects
//! `data` until the owning service decodes it:
//!
//! - `presence:sync` / `presence:join` / `presence:leave`
//! - `broadcast:<topic>`
//! - `change:<entity_type>`
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`.
//! - `from` carries the originating user id when the transport knows it.
//! - `ts` is stamped at construction and doubles as `sentAt` for broadcasts.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// PREFIXES
// =============================================================================

pub const PREFIX_PRESENCE: &str = "presence";
pub const PREFIX_BROADCAST: &str = "broadcast";
pub const PREFIX_CHANGE: &str = "change";

pub const PRESENCE_SYNC: &str = "presence:sync";
pub const PRESENCE_JOIN: &str = "presence:join";
pub const PRESENCE_LEAVE: &str = "presence:leave";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// Which service a frame belongs to, derived from its syscall prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Presence,
    Broadcast,
    Change,
    Unknown,
}

/// The universal envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub from: Option<String>,
    pub syscall: String,
    pub data: Data,
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// CONSTRUCTORS / BUILDERS
// =============================================================================

impl Frame {
    pub fn new(syscall: impl Into<String>, data: Data) -> Self {
        Self { id: Uuid::new_v4(), ts: now_ms(), room_id: None, from: None, syscall: syscall.into(), data }
    }

    #[must_use]
    pub fn with_room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// ROUTING
// =============================================================================

impl Frame {
    /// Extract the syscall prefix (everything before the first ':').
    #[must_use]
    pub fn prefix(&self) -> &str {
        let Some((prefix, _)) = self.syscall.split_once(':') else {
            return &self.syscall;
        };
        prefix
    }

    /// Everything after the first ':' (topic or entity type). Empty if absent.
    #[must_use]
    pub fn suffix(&self) -> &str {
        self.syscall
            .split_once(':')
            .map_or("", |(_, rest)| rest)
    }

    #[must_use]
    pub fn route(&self) -> Route {
        match self.prefix() {
            PREFIX_PRESENCE => Route::Presence,
            PREFIX_BROADCAST => Route::Broadcast,
            PREFIX_CHANGE => Route::Change,
            _ => Route::Unknown,
        }
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
