//! In-process transport and store.
//!
//! `MemoryHub` plays the realtime server: it keeps one member list and one
//! presence map per channel name and fans frames out to members. Presence
//! behaves like a hosted presence service: `track` upserts by user id and
//! every change is followed by a full `sync`. `MemoryStore` plays the
//! database: it owns entity rows and tool regions and pushes change frames
//! to open feeds.
//!
//! Both expose fault injection (denied channels, failed opens, dropped
//! members, silently lost feed events) so reconnection and reconciliation
//! can be exercised without a network.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::frame::Frame;
use crate::services::dispatch::encode_change;
use crate::services::presence::{encode_join, encode_leave, encode_sync};
use crate::transport::{ChangeFeed, ChannelEvent, ChannelSender, OpenedChannel, Store, Transport};
use crate::types::{ChangeEvent, Entity, EntityType, PresenceRecord, RoomId, ToolRegion, UserId};

/// Inbound queue depth per member. A member that falls this far behind
/// loses frames, like a slow websocket client.
const MEMBER_QUEUE: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// HUB
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, ChannelState>,
    denied: HashSet<String>,
    failing_opens: usize,
    opens: HashMap<String, usize>,
    sent: HashMap<String, usize>,
    next_member: u64,
}

#[derive(Default)]
struct ChannelState {
    members: Vec<Member>,
    presence: BTreeMap<UserId, PresenceRecord>,
}

struct Member {
    id: u64,
    user_id: UserId,
    tx: mpsc::Sender<ChannelEvent>,
}

impl ChannelState {
    fn fan_out(&self, frame: &Frame, skip: Option<u64>) {
        for member in self.members.iter().filter(|m| Some(m.id) != skip) {
            if member.tx.try_send(ChannelEvent::Frame(frame.clone())).is_err() {
                debug!(member = member.id, syscall = %frame.syscall, "member queue full; frame dropped");
            }
        }
    }

    fn fan_out_presence(&self, delta: &Frame) {
        self.fan_out(delta, None);
        let records: Vec<PresenceRecord> = self.presence.values().cloned().collect();
        self.fan_out(&encode_sync(&records), None);
    }

    /// Drop a user's presence once none of their members remain.
    fn forget_if_gone(&mut self, user_id: &str) {
        let still_here = self.members.iter().any(|m| m.user_id == user_id);
        if !still_here && self.presence.remove(user_id).is_some() {
            self.fan_out_presence(&encode_leave(user_id));
        }
    }
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every future open of `name` with `TransportError::Denied`.
    pub fn deny(&self, name: &str) {
        lock(&self.inner).denied.insert(name.to_owned());
    }

    pub fn allow(&self, name: &str) {
        lock(&self.inner).denied.remove(name);
    }

    /// Fail the next `n` opens (any channel) with a transient error.
    pub fn fail_next_opens(&self, n: usize) {
        lock(&self.inner).failing_opens = n;
    }

    /// Disconnect every member of `user_id` on `name` as if their socket died.
    pub fn drop_user(&self, name: &str, user_id: &str) {
        let mut state = lock(&self.inner);
        let Some(channel) = state.channels.get_mut(name) else {
            return;
        };
        let (dropped, kept): (Vec<Member>, Vec<Member>) = std::mem::take(&mut channel.members)
            .into_iter()
            .partition(|m| m.user_id == user_id);
        channel.members = kept;
        for member in &dropped {
            let _ = member
                .tx
                .try_send(ChannelEvent::Error(TransportError::Disconnected("connection reset".into())));
        }
        channel.forget_if_gone(user_id);
    }

    /// Disconnect every member of `name`.
    pub fn drop_all(&self, name: &str) {
        let mut state = lock(&self.inner);
        let Some(channel) = state.channels.get_mut(name) else {
            return;
        };
        for member in channel.members.drain(..) {
            let _ = member
                .tx
                .try_send(ChannelEvent::Error(TransportError::Disconnected("server restarted".into())));
        }
        channel.presence.clear();
    }

    /// How many times `name` was opened, including failed attempts.
    #[must_use]
    pub fn open_count(&self, name: &str) -> usize {
        lock(&self.inner).opens.get(name).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn member_count(&self, name: &str) -> usize {
        lock(&self.inner)
            .channels
            .get(name)
            .map_or(0, |c| c.members.len())
    }

    /// Frames sent through `ChannelSender::send` with this syscall.
    #[must_use]
    pub fn sent_count(&self, syscall: &str) -> usize {
        lock(&self.inner).sent.get(syscall).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn presence_users(&self, name: &str) -> Vec<UserId> {
        lock(&self.inner)
            .channels
            .get(name)
            .map(|c| c.presence.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn open(&self, name: &str, user_id: &str) -> Result<OpenedChannel, TransportError> {
        let mut state = lock(&self.inner);
        *state.opens.entry(name.to_owned()).or_default() += 1;

        if state.denied.contains(name) {
            return Err(TransportError::Denied(format!("not a member of {name}")));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::Disconnected("connection refused".into()));
        }

        state.next_member += 1;
        let member_id = state.next_member;
        let (tx, events) = mpsc::channel(MEMBER_QUEUE);

        let channel = state.channels.entry(name.to_owned()).or_default();
        let records: Vec<PresenceRecord> = channel.presence.values().cloned().collect();
        let _ = tx.try_send(ChannelEvent::Subscribed);
        let _ = tx.try_send(ChannelEvent::Frame(encode_sync(&records)));
        channel.members.push(Member { id: member_id, user_id: user_id.to_owned(), tx });
        debug!(channel = name, user_id, member_id, "member joined");

        let sender = MemoryChannel {
            hub: self.inner.clone(),
            name: name.to_owned(),
            member_id,
            user_id: user_id.to_owned(),
        };
        Ok(OpenedChannel { sender: Box::new(sender), events })
    }
}

#[async_trait]
impl Transport for MemoryHub {
    async fn open_channel(&self, name: &str, user_id: &str) -> Result<OpenedChannel, TransportError> {
        self.open(name, user_id)
    }
}

/// One member's outbound half.
struct MemoryChannel {
    hub: Arc<Mutex<HubState>>,
    name: String,
    member_id: u64,
    user_id: UserId,
}

impl MemoryChannel {
    fn with_channel<R>(&self, f: impl FnOnce(&mut ChannelState) -> R) -> Result<R, TransportError> {
        let mut state = lock(&self.hub);
        let channel = state
            .channels
            .get_mut(&self.name)
            .filter(|c| c.members.iter().any(|m| m.id == self.member_id))
            .ok_or_else(|| TransportError::Disconnected(format!("not joined to {}", self.name)))?;
        Ok(f(channel))
    }

    fn leave(&self) {
        let mut state = lock(&self.hub);
        let Some(channel) = state.channels.get_mut(&self.name) else {
            return;
        };
        let before = channel.members.len();
        channel.members.retain(|m| m.id != self.member_id);
        if channel.members.len() != before {
            debug!(channel = %self.name, member_id = self.member_id, "member left");
            channel.forget_if_gone(&self.user_id);
        }
    }
}

#[async_trait]
impl ChannelSender for MemoryChannel {
    async fn track(&self, record: &PresenceRecord) -> Result<(), TransportError> {
        let record = PresenceRecord { user_id: self.user_id.clone(), ..record.clone() };
        self.with_channel(|channel| {
            channel.presence.insert(record.user_id.clone(), record.clone());
            channel.fan_out_presence(&encode_join(&record));
        })
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        self.with_channel(|channel| {
            if channel.presence.remove(&self.user_id).is_some() {
                channel.fan_out_presence(&encode_leave(&self.user_id));
            }
        })
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let syscall = frame.syscall.clone();
        self.with_channel(|channel| channel.fan_out(&frame, Some(self.member_id)))?;
        *lock(&self.hub).sent.entry(syscall).or_default() += 1;
        Ok(())
    }

    async fn close(&self) {
        self.leave();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.leave();
    }
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    rooms: HashMap<RoomId, StoreRoom>,
    fetches: usize,
}

#[derive(Default)]
struct StoreRoom {
    entities: BTreeMap<(EntityType, String), Entity>,
    regions: Vec<ToolRegion>,
    feeds: Vec<(Vec<EntityType>, UnboundedSender<Frame>)>,
}

impl StoreRoom {
    fn write(&mut self, event: &ChangeEvent) {
        let key = (event.entity_type(), event.entity_id.clone());
        match event.change.after_entity() {
            Some(after) => {
                self.entities.insert(key, after);
            }
            None => {
                self.entities.remove(&key);
            }
        }
    }

    fn publish(&mut self, frame: &Frame) {
        let entity_type = EntityType::parse(frame.suffix());
        self.feeds.retain(|(types, tx)| {
            // Frames with an unknown type still go out so consumers see them.
            if entity_type.is_some_and(|t| !types.contains(&t)) {
                return !tx.is_closed();
            }
            tx.unbounded_send(frame.clone()).is_ok()
        });
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_regions(&self, room_id: &str, regions: Vec<ToolRegion>) {
        lock(&self.inner).rooms.entry(room_id.to_owned()).or_default().regions = regions;
    }

    /// Commit a mutation and notify every open feed.
    pub fn apply(&self, room_id: &str, event: &ChangeEvent) {
        let mut state = lock(&self.inner);
        let room = state.rooms.entry(room_id.to_owned()).or_default();
        room.write(event);
        room.publish(&encode_change(event).with_room_id(room_id));
    }

    /// Commit a mutation whose notification is lost in transit.
    pub fn apply_silently(&self, room_id: &str, event: &ChangeEvent) {
        lock(&self.inner).rooms.entry(room_id.to_owned()).or_default().write(event);
    }

    /// Push an arbitrary frame to the room's feeds without touching rows.
    pub fn publish_raw(&self, room_id: &str, frame: Frame) {
        lock(&self.inner).rooms.entry(room_id.to_owned()).or_default().publish(&frame);
    }

    /// Number of `fetch_entities` calls served.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        lock(&self.inner).fetches
    }

    #[must_use]
    pub fn open_feeds(&self, room_id: &str) -> usize {
        lock(&self.inner)
            .rooms
            .get(room_id)
            .map_or(0, |r| r.feeds.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn change_feed(&self, room_id: &str, entity_types: &[EntityType]) -> Result<ChangeFeed, TransportError> {
        let (tx, rx) = unbounded();
        lock(&self.inner)
            .rooms
            .entry(room_id.to_owned())
            .or_default()
            .feeds
            .push((entity_types.to_vec(), tx));
        Ok(rx.boxed())
    }

    async fn query_regions(&self, room_id: &str) -> Result<Vec<ToolRegion>, TransportError> {
        Ok(lock(&self.inner)
            .rooms
            .get(room_id)
            .map(|r| r.regions.clone())
            .unwrap_or_default())
    }

    async fn fetch_entities(&self, room_id: &str) -> Result<Vec<Entity>, TransportError> {
        let mut state = lock(&self.inner);
        state.fetches += 1;
        Ok(state
            .rooms
            .get(room_id)
            .map(|r| r.entities.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Route;

    async fn next_frame(events: &mut mpsc::Receiver<ChannelEvent>) -> Frame {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Frame(f)) => return f,
                Some(_) => {}
                None => panic!("channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn open_confirms_then_syncs() {
        let hub = MemoryHub::new();
        let mut opened = hub.open_channel("room:r", "A").await.expect("open");
        assert!(matches!(opened.events.recv().await, Some(ChannelEvent::Subscribed)));
        let sync = next_frame(&mut opened.events).await;
        assert_eq!(sync.route(), Route::Presence);
        assert_eq!(hub.member_count("room:r"), 1);
        assert_eq!(hub.open_count("room:r"), 1);
    }

    #[tokio::test]
    async fn track_is_keyed_by_user() {
        let hub = MemoryHub::new();
        let a = hub.open_channel("room:r", "A").await.expect("open");
        a.sender.track(&PresenceRecord::new("A", "Ann")).await.expect("track");
        a.sender
            .track(&PresenceRecord::new("A", "Ann").with_tool("pin"))
            .await
            .expect("track");
        assert_eq!(hub.presence_users("room:r"), vec!["A".to_owned()]);
    }

    #[tokio::test]
    async fn send_skips_the_sender_and_counts() {
        let hub = MemoryHub::new();
        let a = hub.open_channel("room:r", "A").await.expect("open");
        let mut b = hub.open_channel("room:r", "B").await.expect("open");
        next_frame(&mut b.events).await; // initial sync

        a.sender
            .send(Frame::new("broadcast:tool", crate::frame::Data::new()).with_from("A"))
            .await
            .expect("send");
        assert_eq!(next_frame(&mut b.events).await.syscall, "broadcast:tool");
        assert_eq!(hub.sent_count("broadcast:tool"), 1);
    }

    #[tokio::test]
    async fn close_and_drop_remove_presence() {
        let hub = MemoryHub::new();
        let a = hub.open_channel("room:r", "A").await.expect("open");
        a.sender.track(&PresenceRecord::new("A", "Ann")).await.expect("track");
        a.sender.close().await;
        a.sender.close().await;
        assert!(hub.presence_users("room:r").is_empty());

        let b = hub.open_channel("room:r", "B").await.expect("open");
        b.sender.track(&PresenceRecord::new("B", "Bo")).await.expect("track");
        drop(b);
        assert_eq!(hub.member_count("room:r"), 0);
        assert!(hub.presence_users("room:r").is_empty());
    }

    #[tokio::test]
    async fn denied_and_failing_opens() {
        let hub = MemoryHub::new();
        hub.deny("room:secret");
        assert!(matches!(
            hub.open_channel("room:secret", "A").await,
            Err(TransportError::Denied(_))
        ));

        hub.fail_next_opens(1);
        assert!(hub.open_channel("room:r", "A").await.is_err());
        assert!(hub.open_channel("room:r", "A").await.is_ok());
        assert_eq!(hub.open_count("room:r"), 2);
    }

    #[tokio::test]
    async fn store_feed_filters_by_type_and_silent_writes_skip_it() {
        use crate::types::Layer;

        let store = MemoryStore::new();
        let mut feed = store
            .change_feed("r", &[EntityType::Layer])
            .await
            .expect("feed");
        let layer = Entity::Layer(Layer { id: "l1".into(), name: "Roof".into(), visible: true, z_order: 0, updated_at: 1 });

        store.apply_silently("r", &ChangeEvent::upsert(layer.clone(), true, 1));
        store.apply("r", &ChangeEvent::upsert(layer, false, 2));

        let frame = feed.next().await.expect("frame");
        assert_eq!(frame.syscall, "change:layer");
        assert_eq!(store.fetch_entities("r").await.expect("fetch").len(), 1);
        assert_eq!(store.fetch_count(), 1);
    }
}
