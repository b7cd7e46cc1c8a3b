//! Collaborator seams: the realtime transport, the persistent store, and the
//! connectivity signal.
//!
//! ARCHITECTURE
//! ============
//! The engine never touches sockets or databases directly. A `Transport`
//! opens one multiplexed channel per room; the `Store` provides the durable
//! change feed plus reference data; `Connectivity` replaces browser
//! online/offline events. Each is injected into `RealtimeManager`, which is
//! what lets tests run against [`memory`].

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, watch};

use crate::error::TransportError;
use crate::frame::Frame;
use crate::types::{Entity, EntityType, PresenceRecord, ToolRegion};

// =============================================================================
// CHANNEL
// =============================================================================

/// Everything a channel can push to the engine.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The transport confirmed the subscription.
    Subscribed,
    /// A presence or broadcast frame.
    Frame(Frame),
    /// The channel failed; the engine decides whether to retry.
    Error(TransportError),
    /// The remote side closed the channel.
    Closed,
}

/// Outbound half of an open channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Publish or replace the caller's presence record.
    async fn track(&self, record: &PresenceRecord) -> Result<(), TransportError>;

    /// Remove the caller's presence record.
    async fn untrack(&self) -> Result<(), TransportError>;

    /// Fire-and-forget broadcast to the other members of the channel.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Leave the channel. Must be safe to call more than once.
    async fn close(&self);
}

/// A freshly opened channel: the sender plus the inbound event queue.
pub struct OpenedChannel {
    pub sender: Box<dyn ChannelSender>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the multiplexed channel identified by `name` on behalf of `user_id`.
    async fn open_channel(&self, name: &str, user_id: &str) -> Result<OpenedChannel, TransportError>;
}

// =============================================================================
// STORE
// =============================================================================

/// Raw change-feed frames (`change:<entity_type>`), decoded by the dispatcher.
pub type ChangeFeed = BoxStream<'static, Frame>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Durable entity mutations for `room_id`, filtered to `entity_types`.
    async fn change_feed(&self, room_id: &str, entity_types: &[EntityType]) -> Result<ChangeFeed, TransportError>;

    /// Tool regions for the room. Loaded once per room session.
    async fn query_regions(&self, room_id: &str) -> Result<Vec<ToolRegion>, TransportError>;

    /// Current state of every entity in the room, used for reconciliation.
    async fn fetch_entities(&self, room_id: &str) -> Result<Vec<Entity>, TransportError>;
}

// =============================================================================
// CONNECTIVITY
// =============================================================================

pub trait Connectivity: Send + Sync {
    /// Watch the online flag. `true` means the network is believed reachable.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven explicitly by the embedder (or a test).
pub struct ConnectivitySignal {
    tx: watch::Sender<bool>,
}

impl ConnectivitySignal {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Report an online/offline transition. Repeated values are ignored.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ConnectivitySignal {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivitySignal {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connectivity_signal_notifies_only_on_change() {
        let signal = ConnectivitySignal::new(true);
        let mut rx = signal.subscribe();
        rx.borrow_and_update();

        signal.set_online(true);
        assert!(!rx.has_changed().expect("sender alive"));

        signal.set_online(false);
        assert!(rx.has_changed().expect("sender alive"));
        assert!(!*rx.borrow_and_update());
        assert!(!signal.is_online());
    }
}
