//! Trailing-edge throttle for high-frequency broadcast topics.
//!
//! DESIGN
//! ======
//! The first offer for a key opens a window of `window` length. Offers
//! that land inside an open window replace the pending value. When the
//! window closes the latest value is flushed and the key goes idle; the
//! next offer opens a fresh window. A key therefore emits at most once per
//! window regardless of input rate.
//!
//! Timestamps are passed in explicitly so tests can drive the clock.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

struct Pending<V> {
    value: V,
    due: Instant,
    collapsed: usize,
}

pub struct Throttle<V> {
    window: Duration,
    pending: HashMap<String, Pending<V>>,
}

impl<V> Throttle<V> {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { window, pending: HashMap::new() }
    }

    /// Offer a value for `key`. Returns `true` when this offer opened a new
    /// window, `false` when it replaced a pending value.
    pub fn offer_at(&mut self, key: &str, value: V, now: Instant) -> bool {
        if let Some(pending) = self.pending.get_mut(key) {
            pending.value = value;
            pending.collapsed += 1;
            return false;
        }
        self.pending
            .insert(key.to_owned(), Pending { value, due: now + self.window, collapsed: 0 });
        true
    }

    /// Earliest window boundary among pending keys.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Remove and return every value whose window has closed, oldest first.
    /// The third tuple field counts how many offers were collapsed into it.
    pub fn take_due_at(&mut self, now: Instant) -> Vec<(String, V, usize)> {
        let mut due_keys: Vec<(Instant, String)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(k, p)| (p.due, k.clone()))
            .collect();
        due_keys.sort();

        due_keys
            .into_iter()
            .filter_map(|(_, key)| {
                self.pending
                    .remove(&key)
                    .map(|p| (key, p.value, p.collapsed))
            })
            .collect()
    }

    /// Abandon everything pending (used when the channel goes away).
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[path = "throttle_test.rs"]
mod tests;
