//! Local handler registration.
//!
//! Each subscriber lease brings its own `RoomHandlers`. The room task owns
//! the registry and invokes handlers one at a time, in registration order,
//! so handler code never needs its own locking for per-room state.

use uuid::Uuid;

use crate::error::SyncError;
use crate::services::presence::PresenceEvent;
use crate::types::{BroadcastMessage, ChangeEvent, EntityType};

pub type ChangeHandler = Box<dyn FnMut(&ChangeEvent) + Send>;
pub type PresenceHandler = Box<dyn FnMut(&PresenceEvent) + Send>;
pub type BroadcastHandler = Box<dyn FnMut(&BroadcastMessage) + Send>;
pub type ErrorHandler = Box<dyn FnMut(&SyncError) + Send>;

/// Handlers a subscriber wants attached to a room.
#[derive(Default)]
pub struct RoomHandlers {
    changes: Vec<(EntityType, ChangeHandler)>,
    presence: Vec<PresenceHandler>,
    broadcasts: Vec<(String, BroadcastHandler)>,
    errors: Vec<ErrorHandler>,
    diagnostics: Vec<ErrorHandler>,
}

impl RoomHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive applied changes for one entity type.
    #[must_use]
    pub fn on_change(mut self, entity_type: EntityType, f: impl FnMut(&ChangeEvent) + Send + 'static) -> Self {
        self.changes.push((entity_type, Box::new(f)));
        self
    }

    /// Receive presence sync snapshots, deltas, and peer cursor moves.
    #[must_use]
    pub fn on_presence(mut self, f: impl FnMut(&PresenceEvent) + Send + 'static) -> Self {
        self.presence.push(Box::new(f));
        self
    }

    /// Receive broadcasts from other users on `topic`.
    #[must_use]
    pub fn on_broadcast(mut self, topic: impl Into<String>, f: impl FnMut(&BroadcastMessage) + Send + 'static) -> Self {
        self.broadcasts.push((topic.into(), Box::new(f)));
        self
    }

    /// Receive errors that end the subscription (the room rejected the
    /// user). Transient connection trouble shows up only in the handle's
    /// status.
    #[must_use]
    pub fn on_error(mut self, f: impl FnMut(&SyncError) + Send + 'static) -> Self {
        self.errors.push(Box::new(f));
        self
    }

    /// Receive non-fatal problems for observability: lost connections and
    /// skipped undecodable change events.
    #[must_use]
    pub fn on_diagnostic(mut self, f: impl FnMut(&SyncError) + Send + 'static) -> Self {
        self.diagnostics.push(Box::new(f));
        self
    }

    fn merge(&mut self, other: RoomHandlers) {
        self.changes.extend(other.changes);
        self.presence.extend(other.presence);
        self.broadcasts.extend(other.broadcasts);
        self.errors.extend(other.errors);
        self.diagnostics.extend(other.diagnostics);
    }

    fn has_presence(&self) -> bool {
        !self.presence.is_empty()
    }
}

impl std::fmt::Debug for RoomHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandlers")
            .field("changes", &self.changes.len())
            .field("presence", &self.presence.len())
            .field("broadcasts", &self.broadcasts.len())
            .field("errors", &self.errors.len())
            .field("diagnostics", &self.diagnostics.len())
            .finish()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    leases: Vec<(Uuid, RoomHandlers)>,
}

impl HandlerRegistry {
    /// Attach handlers for a lease. Returns `true` if the new handlers
    /// include presence handlers (the caller then owes them a snapshot).
    pub(crate) fn add(&mut self, lease: Uuid, handlers: RoomHandlers) -> bool {
        let wants_presence = handlers.has_presence();
        if let Some((_, existing)) = self.leases.iter_mut().find(|(id, _)| *id == lease) {
            existing.merge(handlers);
        } else {
            self.leases.push((lease, handlers));
        }
        wants_presence
    }

    pub(crate) fn add_broadcast(&mut self, lease: Uuid, topic: String, handler: BroadcastHandler) {
        let handlers = RoomHandlers { broadcasts: vec![(topic, handler)], ..RoomHandlers::default() };
        self.add(lease, handlers);
    }

    pub(crate) fn remove(&mut self, lease: Uuid) {
        self.leases.retain(|(id, _)| *id != lease);
    }

    pub(crate) fn emit_change(&mut self, event: &ChangeEvent) {
        let entity_type = event.entity_type();
        for (_, handlers) in &mut self.leases {
            for (ty, f) in &mut handlers.changes {
                if *ty == entity_type {
                    f(event);
                }
            }
        }
    }

    pub(crate) fn emit_presence(&mut self, event: &PresenceEvent) {
        for (_, handlers) in &mut self.leases {
            for f in &mut handlers.presence {
                f(event);
            }
        }
    }

    /// Deliver to one lease only (catch-up snapshot for late subscribers).
    pub(crate) fn emit_presence_to(&mut self, lease: Uuid, event: &PresenceEvent) {
        for (_, handlers) in self.leases.iter_mut().filter(|(id, _)| *id == lease) {
            for f in &mut handlers.presence {
                f(event);
            }
        }
    }

    /// Returns how many handlers saw the message.
    pub(crate) fn emit_broadcast(&mut self, message: &BroadcastMessage) -> usize {
        let mut delivered = 0;
        for (_, handlers) in &mut self.leases {
            for (topic, f) in &mut handlers.broadcasts {
                if *topic == message.topic {
                    f(message);
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Fatal errors go to `on_error`, everything else to `on_diagnostic`.
    pub(crate) fn emit_error(&mut self, error: &SyncError) {
        let fatal = error.is_fatal();
        for (_, handlers) in &mut self.leases {
            let sinks = if fatal { &mut handlers.errors } else { &mut handlers.diagnostics };
            for f in sinks {
                f(error);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::types::{Entity, Layer};

    fn layer_event() -> ChangeEvent {
        ChangeEvent::upsert(
            Entity::Layer(Layer { id: "l1".into(), name: "Roof".into(), visible: true, z_order: 0, updated_at: 1 }),
            true,
            1,
        )
    }

    #[test]
    fn change_handlers_filter_by_entity_type() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (pins, layers) = (seen.clone(), seen.clone());
        let mut registry = HandlerRegistry::default();
        registry.add(
            Uuid::new_v4(),
            RoomHandlers::new()
                .on_change(EntityType::Pin, move |_| pins.lock().unwrap().push("pin"))
                .on_change(EntityType::Layer, move |_| layers.lock().unwrap().push("layer")),
        );

        registry.emit_change(&layer_event());
        assert_eq!(*seen.lock().unwrap(), vec!["layer"]);
    }

    #[test]
    fn removed_lease_stops_receiving() {
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let lease = Uuid::new_v4();
        let mut registry = HandlerRegistry::default();
        registry.add(lease, RoomHandlers::new().on_presence(move |_| *c.lock().unwrap() += 1));

        registry.emit_presence(&PresenceEvent::Leave("A".into()));
        registry.remove(lease);
        registry.emit_presence(&PresenceEvent::Leave("A".into()));

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn broadcast_handlers_match_topic_and_merge_into_lease() {
        let lease = Uuid::new_v4();
        let mut registry = HandlerRegistry::default();
        assert!(!registry.add(lease, RoomHandlers::new()));
        registry.add_broadcast(lease, "tool".into(), Box::new(|_| {}));
        assert_eq!(registry.len(), 1);

        let msg = BroadcastMessage {
            topic: "tool".into(),
            payload: serde_json::Value::Null,
            sender_id: "B".into(),
            sent_at: 0,
        };
        assert_eq!(registry.emit_broadcast(&msg), 1);

        let other = BroadcastMessage { topic: "cursor".into(), ..msg };
        assert_eq!(registry.emit_broadcast(&other), 0);
    }

    #[test]
    fn targeted_presence_reaches_only_that_lease() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (h1, h2) = (hits.clone(), hits.clone());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut registry = HandlerRegistry::default();
        registry.add(a, RoomHandlers::new().on_presence(move |_| h1.lock().unwrap().push("a")));
        assert!(registry.add(b, RoomHandlers::new().on_presence(move |_| h2.lock().unwrap().push("b"))));

        registry.emit_presence_to(b, &PresenceEvent::Sync(Vec::new()));
        assert_eq!(*hits.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn only_fatal_errors_reach_error_handlers() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let (e, d) = (errors.clone(), diagnostics.clone());
        let mut registry = HandlerRegistry::default();
        registry.add(
            Uuid::new_v4(),
            RoomHandlers::new()
                .on_error(move |err| e.lock().unwrap().push(err.clone()))
                .on_diagnostic(move |err| d.lock().unwrap().push(err.clone())),
        );

        let dropped = SyncError::Connection { room_id: "r".into(), reason: "closed".into() };
        let undecodable = SyncError::from(crate::error::ChangeDecodeError::new("change:pin", "missing after"));
        let denied = SyncError::Subscription { room_id: "r".into(), reason: "denied".into() };
        registry.emit_error(&dropped);
        registry.emit_error(&undecodable);
        registry.emit_error(&denied);

        assert_eq!(*errors.lock().unwrap(), vec![denied]);
        assert_eq!(*diagnostics.lock().unwrap(), vec![dropped, undecodable]);
    }
}
