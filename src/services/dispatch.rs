//! Change dispatcher: decode durable mutation notifications and keep the
//! local entity cache eventually consistent.
//!
//! DESIGN
//! ======
//! Every `change:<entity_type>` frame is decoded into the closed
//! `EntityChange` union. Decoding failures are per-event: the caller logs
//! and skips them, the stream keeps flowing.
//!
//! APPLY POLICY
//! ============
//! - Insert/Update replace the cached entity only if `after.updated_at` is
//!   not older than what is cached (last write wins, ties re-apply).
//! - Delete removes the entity and leaves a tombstone so a late, older
//!   Insert/Update cannot resurrect it.
//! - Deleting an absent entity is a no-op.
//! Re-applying the same event is therefore harmless.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ChangeDecodeError;
use crate::frame::{Data, Frame, PREFIX_CHANGE};
use crate::types::{Change, ChangeEvent, Entity, EntityChange, EntityType, Operation, Snapshot, UserId};

// =============================================================================
// DECODE
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawChange {
    #[serde(default, alias = "entityType")]
    entity_type: Option<EntityType>,
    operation: Operation,
    #[serde(alias = "entityId")]
    entity_id: String,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
    #[serde(default, alias = "occurredAt", deserialize_with = "crate::types::timestamp_ms_opt")]
    occurred_at: Option<i64>,
    #[serde(default, alias = "originUserId")]
    origin_user_id: Option<UserId>,
}

/// Decode a change-feed frame into a typed event.
///
/// # Errors
///
/// Returns `ChangeDecodeError` when the entity type is unknown or
/// contradictory, required snapshots are missing or malformed, or the
/// snapshot id does not match `entity_id`.
pub fn decode_change(frame: &Frame) -> Result<ChangeEvent, ChangeDecodeError> {
    let syscall = frame.syscall.as_str();
    let fail = |reason: String| ChangeDecodeError::new(syscall, reason);

    let data = serde_json::to_value(&frame.data).map_err(|e| fail(e.to_string()))?;
    let raw: RawChange = serde_json::from_value(data).map_err(|e| fail(e.to_string()))?;

    let from_syscall = match frame.suffix() {
        "" => None,
        s => Some(EntityType::parse(s).ok_or_else(|| fail(format!("unknown entity type: {s}")))?),
    };
    let entity_type = match (from_syscall, raw.entity_type) {
        (Some(a), Some(b)) if a != b => return Err(fail(format!("entity type mismatch: {a} vs {b}"))),
        (Some(t), _) | (None, Some(t)) => t,
        (None, None) => return Err(fail("missing entity type".into())),
    };

    let RawChange { operation, entity_id, before, after, occurred_at, origin_user_id, .. } = raw;
    let parts = Parts { operation, entity_id: &entity_id, before, after };
    let change = match entity_type {
        EntityType::Pin => EntityChange::Pin(typed(parts).map_err(fail)?),
        EntityType::ChildPin => EntityChange::ChildPin(typed(parts).map_err(fail)?),
        EntityType::Layer => EntityChange::Layer(typed(parts).map_err(fail)?),
        EntityType::Annotation => EntityChange::Annotation(typed(parts).map_err(fail)?),
    };

    Ok(ChangeEvent { change, entity_id, occurred_at: occurred_at.unwrap_or(frame.ts), origin_user_id })
}

struct Parts<'a> {
    operation: Operation,
    entity_id: &'a str,
    before: Option<Value>,
    after: Option<Value>,
}

fn typed<T: Snapshot>(parts: Parts<'_>) -> Result<Change<T>, String> {
    let before = snapshot::<T>(parts.before, "before")?;
    let after = snapshot::<T>(parts.after, "after")?;

    for snap in before.iter().chain(after.iter()) {
        if snap.id() != parts.entity_id {
            return Err(format!("snapshot id {} does not match entity_id {}", snap.id(), parts.entity_id));
        }
    }

    match parts.operation {
        Operation::Insert => {
            let after = after.ok_or_else(|| "insert without after".to_owned())?;
            Ok(Change::Insert { after })
        }
        Operation::Update => {
            let after = after.ok_or_else(|| "update without after".to_owned())?;
            Ok(Change::Update { before, after })
        }
        Operation::Delete => Ok(Change::Delete { before }),
    }
}

fn snapshot<T: Snapshot>(value: Option<Value>, field: &str) -> Result<Option<T>, String> {
    value
        .filter(|v| !v.is_null())
        .map(|v| serde_json::from_value::<T>(v).map_err(|e| format!("invalid {field}: {e}")))
        .transpose()
}

// =============================================================================
// ENCODE
// =============================================================================

/// Inverse of `decode_change`, used by store adapters and tests.
#[must_use]
pub fn encode_change(event: &ChangeEvent) -> Frame {
    let (before, after) = match &event.change {
        EntityChange::Pin(c) => snapshot_values(c),
        EntityChange::ChildPin(c) => snapshot_values(c),
        EntityChange::Layer(c) => snapshot_values(c),
        EntityChange::Annotation(c) => snapshot_values(c),
    };
    let entity_type = event.entity_type();

    let mut frame = Frame::new(format!("{PREFIX_CHANGE}:{entity_type}"), Data::new())
        .with_data("entity_type", entity_type.as_str())
        .with_data("operation", json_or_null(&event.operation()))
        .with_data("entity_id", event.entity_id.clone())
        .with_data("before", before)
        .with_data("after", after)
        .with_data("occurred_at", event.occurred_at);
    if let Some(origin) = &event.origin_user_id {
        frame = frame
            .with_data("origin_user_id", origin.clone())
            .with_from(origin.clone());
    }
    frame
}

fn snapshot_values<T: Serialize>(change: &Change<T>) -> (Value, Value) {
    let before = change.before().map_or(Value::Null, json_or_null);
    let after = change.after().map_or(Value::Null, json_or_null);
    (before, after)
}

fn json_or_null<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// =============================================================================
// ENTITY CACHE
// =============================================================================

/// Result of applying one event to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Insert/Update stored.
    Applied,
    /// Delete removed a cached entity.
    Removed,
    /// Older than what is cached (or deleted); ignored.
    Stale,
    /// Identical snapshot already cached (redelivery); ignored.
    Unchanged,
    /// Delete for an entity that is not cached; ignored.
    Absent,
}

impl ApplyOutcome {
    /// Whether handlers should hear about the event.
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, Self::Applied | Self::Removed)
    }
}

type EntityKey = (EntityType, String);

#[derive(Debug, Default)]
pub struct EntityCache {
    entities: BTreeMap<EntityKey, Entity>,
    tombstones: HashMap<EntityKey, i64>,
}

impl EntityCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        let key = (event.entity_type(), event.entity_id.clone());

        let Some(after) = event.change.after_entity() else {
            return self.remove(key, event.occurred_at);
        };

        let incoming = after.updated_at();
        if let Some(current) = self.entities.get(&key) {
            if incoming < current.updated_at() {
                return ApplyOutcome::Stale;
            }
            if *current == after {
                return ApplyOutcome::Unchanged;
            }
        } else if let Some(&deleted_at) = self.tombstones.get(&key) {
            if incoming <= deleted_at {
                return ApplyOutcome::Stale;
            }
        }

        self.tombstones.remove(&key);
        self.entities.insert(key, after);
        ApplyOutcome::Applied
    }

    fn remove(&mut self, key: EntityKey, occurred_at: i64) -> ApplyOutcome {
        if let Some(current) = self.entities.get(&key) {
            if current.updated_at() > occurred_at {
                return ApplyOutcome::Stale;
            }
        }
        let tombstone = self.tombstones.entry(key.clone()).or_insert(occurred_at);
        *tombstone = (*tombstone).max(occurred_at);

        if self.entities.remove(&key).is_some() {
            ApplyOutcome::Removed
        } else {
            ApplyOutcome::Absent
        }
    }

    #[must_use]
    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<&Entity> {
        self.entities.get(&(entity_type, id.to_owned()))
    }

    /// Deletion time recorded for an entity, if any.
    #[must_use]
    pub fn tombstone(&self, entity_type: EntityType, id: &str) -> Option<i64> {
        self.tombstones.get(&(entity_type, id.to_owned())).copied()
    }

    /// Cached entities ordered by (type, id).
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Decode + apply in one step. Returns the event only when local state
/// actually changed, so handlers never see stale or duplicate deliveries.
#[derive(Debug, Default)]
pub struct ChangeDispatcher {
    cache: EntityCache,
}

impl ChangeDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns the decode error for this single frame; the cache is untouched.
    pub fn handle_frame(&mut self, frame: &Frame) -> Result<Option<ChangeEvent>, ChangeDecodeError> {
        let event = decode_change(frame)?;
        Ok(self.apply(event))
    }

    pub fn apply(&mut self, event: ChangeEvent) -> Option<ChangeEvent> {
        let outcome = self.cache.apply(&event);
        tracing::debug!(
            entity_type = %event.entity_type(),
            entity_id = %event.entity_id,
            ?outcome,
            "change applied"
        );
        outcome.changed().then_some(event)
    }

    #[must_use]
    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
