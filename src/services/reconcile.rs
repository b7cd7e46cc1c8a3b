//! Reconciliation: repair divergence the change feed failed to deliver.
//!
//! DESIGN
//! ======
//! The feed is not trusted to be lossless. On every (re)connect and on a
//! timer, the room task fetches the store's current entities and diffs them
//! against the local cache. The diff is expressed as ordinary
//! `ChangeEvent`s, so repairs flow through the same apply policy and the
//! same handlers as live changes.
//!
//! - store has it, cache does not → Insert (unless a newer tombstone exists)
//! - store copy is newer → Update
//! - cache has it, store does not → Delete stamped with the cached copy's
//!   `updated_at`, so the tombstone stays on the store's clock and any
//!   later write from the store supersedes it

use std::collections::HashSet;

use crate::services::dispatch::EntityCache;
use crate::types::{ChangeEvent, Entity, EntityType};

#[must_use]
pub fn diff(cache: &EntityCache, fresh: Vec<Entity>) -> Vec<ChangeEvent> {
    let mut seen: HashSet<(EntityType, String)> = HashSet::with_capacity(fresh.len());
    let mut events = Vec::new();

    for entity in fresh {
        let entity_type = entity.entity_type();
        let id = entity.id().to_owned();
        let updated_at = entity.updated_at();

        match cache.get(entity_type, &id) {
            Some(current) if updated_at > current.updated_at() => {
                events.push(ChangeEvent::upsert(entity, false, updated_at));
            }
            Some(_) => {}
            None => {
                let buried = cache
                    .tombstone(entity_type, &id)
                    .is_some_and(|deleted_at| deleted_at >= updated_at);
                if !buried {
                    events.push(ChangeEvent::upsert(entity, true, updated_at));
                }
            }
        }
        seen.insert((entity_type, id));
    }

    for cached in cache.iter() {
        if !seen.contains(&(cached.entity_type(), cached.id().to_owned())) {
            events.push(ChangeEvent::removal(cached.clone(), cached.updated_at()));
        }
    }

    events
}
