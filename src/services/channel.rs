//! Room channel manager: one live channel per room, shared by every
//! subscriber in the process.
//!
//! DESIGN
//! ======
//! `RealtimeManager` is an explicit, injectable instance; nothing is global.
//! It keeps a map of room id → room entry. The first `subscribe` for a room
//! spawns the room task (see `reconnect`); later calls for the same room
//! attach their handlers to the running task and receive a new lease on the
//! same subscription. Only the release of the last lease tears the channel
//! down, so "subscribe twice, unsubscribe once" keeps the room alive.
//!
//! LIFECYCLE
//! =========
//! - `subscribe` waits for the first settled status: Ok once Subscribed,
//!   Err on a first-connect failure or a rejected subscription.
//! - A room task that ended on its own (fatal error) is replaced by the next
//!   `subscribe`.
//! - `unsubscribe` is idempotent. Stale handles (old subscription id or an
//!   already released lease) are ignored.
//! - Releasing the last lease leaves a closing marker in the map until the
//!   room task has untracked and closed its channel. A `subscribe` that
//!   finds the marker waits for it, so a room never has two channels open.
//!
//! LOCKING
//! =======
//! The map lock only guards bookkeeping. Nothing awaits a room's command
//! queue or task while holding it, so one busy room cannot stall the others.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::frame::now_ms;
use crate::services::handlers::RoomHandlers;
use crate::services::reconnect::{self, ConnectionState, RoomCommand, RoomContext, RoomInputs, RoomStatus};
use crate::services::tool_gate;
use crate::transport::{Connectivity, Store, Transport};
use crate::types::{
    BroadcastMessage, Entity, EntityType, PresenceRecord, RoomId, SubscriptionStatus, ToolRegion, UserId,
};

/// Identity of the user this process acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub user_id: UserId,
    pub display_name: String,
}

impl LocalUser {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), display_name: display_name.into() }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

#[derive(Clone)]
struct RoomWatches {
    status: watch::Receiver<RoomStatus>,
    users: watch::Receiver<usize>,
    regions: watch::Receiver<Arc<Vec<ToolRegion>>>,
}

/// A caller's lease on a room subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub room_id: RoomId,
    /// Shared by every lease on the same live channel.
    pub subscription_id: Uuid,
    /// Unique to this caller.
    pub lease_id: Uuid,
    pub created_at: i64,
    watches: RoomWatches,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        self.watches.status.borrow().status
    }

    /// Watch every status change (for UI indicators).
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<RoomStatus> {
        self.watches.status.clone()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.watches.status.borrow().state
    }

    #[must_use]
    pub fn backoff_attempt(&self) -> u32 {
        self.watches.status.borrow().attempt
    }

    #[must_use]
    pub fn last_error(&self) -> Option<SyncError> {
        self.watches.status.borrow().last_error.clone()
    }

    /// Number of users currently present, local user included.
    #[must_use]
    pub fn active_users(&self) -> usize {
        *self.watches.users.borrow()
    }

    #[must_use]
    pub fn active_users_watch(&self) -> watch::Receiver<usize> {
        self.watches.users.clone()
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("room_id", &self.room_id)
            .field("subscription_id", &self.subscription_id)
            .field("lease_id", &self.lease_id)
            .field("created_at", &self.created_at)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// MANAGER
// =============================================================================

struct RoomEntry {
    subscription_id: Uuid,
    created_at: i64,
    leases: HashSet<Uuid>,
    commands: mpsc::Sender<RoomCommand>,
    task: JoinHandle<()>,
    watches: RoomWatches,
}

impl RoomEntry {
    fn handle(&self, room_id: &str, lease_id: Uuid) -> SubscriptionHandle {
        SubscriptionHandle {
            room_id: room_id.to_owned(),
            subscription_id: self.subscription_id,
            lease_id,
            created_at: self.created_at,
            watches: self.watches.clone(),
        }
    }
}

/// A room in the map: running, or closing its channel after the last lease
/// was released. The closing marker flips to `true` once the old task is gone.
enum RoomSlot {
    Live(RoomEntry),
    Closing(watch::Receiver<bool>),
}

/// What `subscribe` found for a room, decided under the map lock.
enum Found {
    Closing(watch::Receiver<bool>),
    Joined { commands: mpsc::Sender<RoomCommand>, handle: SubscriptionHandle },
    Spawned(SubscriptionHandle),
}

struct ManagerInner {
    user: LocalUser,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    connectivity: Arc<dyn Connectivity>,
    config: SyncConfig,
    rooms: Mutex<HashMap<RoomId, RoomSlot>>,
}

#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<ManagerInner>,
}

impl RealtimeManager {
    pub fn new(
        user: LocalUser,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        connectivity: Arc<dyn Connectivity>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                user,
                transport,
                store,
                connectivity,
                config,
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn user(&self) -> &LocalUser {
        &self.inner.user
    }

    /// Subscribe to a room, sharing the channel if one is already live.
    ///
    /// # Errors
    ///
    /// `SyncError::Connection` if the first connect attempt failed,
    /// `SyncError::Subscription` if the transport rejected the room.
    pub async fn subscribe(&self, room_id: &str, handlers: RoomHandlers) -> Result<SubscriptionHandle, SyncError> {
        let lease_id = Uuid::new_v4();
        let mut handlers = Some(handlers);

        let handle = loop {
            let found = {
                let mut rooms = self.inner.rooms.lock().await;
                match rooms.get_mut(room_id) {
                    Some(RoomSlot::Closing(done)) => Found::Closing(done.clone()),
                    Some(RoomSlot::Live(entry)) if !entry.task.is_finished() => {
                        entry.leases.insert(lease_id);
                        debug!(%room_id, subscription_id = %entry.subscription_id, leases = entry.leases.len(), "joined live room");
                        Found::Joined { commands: entry.commands.clone(), handle: entry.handle(room_id, lease_id) }
                    }
                    stale => {
                        if stale.is_some() {
                            debug!(%room_id, "replacing finished room task");
                        }
                        let entry = self.spawn_room(room_id, lease_id, handlers.take().unwrap_or_default());
                        let handle = entry.handle(room_id, lease_id);
                        info!(%room_id, subscription_id = %entry.subscription_id, "room subscription created");
                        rooms.insert(room_id.to_owned(), RoomSlot::Live(entry));
                        Found::Spawned(handle)
                    }
                }
            };

            match found {
                Found::Closing(done) => self.wait_closed(room_id, done).await,
                Found::Joined { commands, handle } => {
                    let cmd = RoomCommand::AddHandlers { lease: lease_id, handlers: handlers.take().unwrap_or_default() };
                    if commands.send(cmd).await.is_err() {
                        self.forget_lease(&handle).await;
                        return Err(SyncError::Inactive(room_id.to_owned()));
                    }
                    break handle;
                }
                Found::Spawned(handle) => break handle,
            }
        };

        let status = settled_status(handle.status_watch()).await;
        if status.status == SubscriptionStatus::Subscribed || status.ever_connected {
            return Ok(handle);
        }

        let err = status
            .last_error
            .unwrap_or_else(|| SyncError::Inactive(room_id.to_owned()));
        warn!(%room_id, error = %err, "subscribe failed");
        self.unsubscribe(&handle).await;
        Err(err)
    }

    fn spawn_room(&self, room_id: &str, lease_id: Uuid, handlers: RoomHandlers) -> RoomEntry {
        let (status_tx, status_rx) = watch::channel(RoomStatus::default());
        let (users_tx, users_rx) = watch::channel(0_usize);
        let (regions_tx, regions_rx) = watch::channel(Arc::new(Vec::new()));
        let (commands_tx, commands_rx) = mpsc::channel(self.inner.config.command_capacity.max(1));

        let ctx = RoomContext {
            room_id: room_id.to_owned(),
            user_id: self.inner.user.user_id.clone(),
            transport: self.inner.transport.clone(),
            store: self.inner.store.clone(),
            config: self.inner.config.clone(),
            status_tx,
            users_tx,
            regions_tx,
        };
        let inputs = RoomInputs {
            commands: commands_rx,
            online: self.inner.connectivity.subscribe(),
            online_alive: true,
        };
        let task = tokio::spawn(reconnect::run_room(ctx, inputs, lease_id, handlers));

        RoomEntry {
            subscription_id: Uuid::new_v4(),
            created_at: now_ms(),
            leases: HashSet::from([lease_id]),
            commands: commands_tx,
            task,
            watches: RoomWatches { status: status_rx, users: users_rx, regions: regions_rx },
        }
    }

    /// Wait for a closing room's task to finish. If the closer vanished
    /// without clearing its marker, clear it here.
    async fn wait_closed(&self, room_id: &str, mut done: watch::Receiver<bool>) {
        debug!(%room_id, "waiting for previous room channel to close");
        if done.wait_for(|closed| *closed).await.is_ok() {
            return;
        }
        let mut rooms = self.inner.rooms.lock().await;
        if let Some(RoomSlot::Closing(marker)) = rooms.get(room_id) {
            if marker.same_channel(&done) {
                rooms.remove(room_id);
            }
        }
    }

    async fn forget_lease(&self, handle: &SubscriptionHandle) {
        let mut rooms = self.inner.rooms.lock().await;
        if let Some(RoomSlot::Live(entry)) = rooms.get_mut(&handle.room_id) {
            if entry.subscription_id == handle.subscription_id {
                entry.leases.remove(&handle.lease_id);
            }
        }
    }

    /// Release a lease. The last lease closes the room channel and waits for
    /// the room task to finish. Unknown or stale handles are ignored.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let room_id = &handle.room_id;
        let (commands, teardown) = {
            let mut rooms = self.inner.rooms.lock().await;
            let Some(RoomSlot::Live(entry)) = rooms.get_mut(room_id) else {
                return;
            };
            if entry.subscription_id != handle.subscription_id || !entry.leases.remove(&handle.lease_id) {
                return;
            }
            if entry.leases.is_empty() {
                let (done_tx, done_rx) = watch::channel(false);
                match rooms.insert(room_id.clone(), RoomSlot::Closing(done_rx)) {
                    Some(RoomSlot::Live(entry)) => (entry.commands, Some((entry.task, done_tx))),
                    _ => return,
                }
            } else {
                debug!(%room_id, leases = entry.leases.len(), "lease released");
                (entry.commands.clone(), None)
            }
        };

        let Some((task, done_tx)) = teardown else {
            let _ = commands.send(RoomCommand::RemoveLease { lease: handle.lease_id }).await;
            return;
        };

        // Teardown runs detached so a cancelled caller cannot strand the
        // closing marker.
        let inner = self.inner.clone();
        let room = room_id.clone();
        let subscription_id = handle.subscription_id;
        let closing = tokio::spawn(async move {
            let _ = commands.send(RoomCommand::Shutdown).await;
            if let Err(e) = task.await {
                warn!(room_id = %room, error = %e, "room task ended abnormally");
            }
            {
                let mut rooms = inner.rooms.lock().await;
                if matches!(rooms.get(&room), Some(RoomSlot::Closing(_))) {
                    rooms.remove(&room);
                }
            }
            done_tx.send_replace(true);
            info!(room_id = %room, %subscription_id, "room subscription removed");
        });
        if let Err(e) = closing.await {
            warn!(%room_id, error = %e, "room teardown failed");
        }
    }

    // -------------------------------------------------------------------------
    // Presence
    // -------------------------------------------------------------------------

    /// Publish the local user's presence record. It is re-published after
    /// every reconnect until `untrack`.
    ///
    /// # Errors
    ///
    /// `SyncError::Inactive` if the handle no longer refers to a live room.
    pub async fn track(&self, handle: &SubscriptionHandle, record: PresenceRecord) -> Result<(), SyncError> {
        self.send(handle, RoomCommand::Track(record)).await
    }

    /// # Errors
    ///
    /// `SyncError::Inactive` if the handle no longer refers to a live room.
    pub async fn untrack(&self, handle: &SubscriptionHandle) -> Result<(), SyncError> {
        self.send(handle, RoomCommand::Untrack).await
    }

    /// Everyone present, local user included, ordered by user id.
    ///
    /// # Errors
    ///
    /// `SyncError::Inactive` if the handle no longer refers to a live room.
    pub async fn presence(&self, handle: &SubscriptionHandle) -> Result<Vec<PresenceRecord>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(handle, RoomCommand::Presence(reply)).await?;
        rx.await.map_err(|_| SyncError::Inactive(handle.room_id.clone()))
    }

    /// Everyone present except the local user.
    ///
    /// # Errors
    ///
    /// `SyncError::Inactive` if the handle no longer refers to a live room.
    pub async fn peers(&self, handle: &SubscriptionHandle) -> Result<Vec<PresenceRecord>, SyncError> {
        let mut records = self.presence(handle).await?;
        records.retain(|r| r.user_id != self.inner.user.user_id);
        Ok(records)
    }

    // -------------------------------------------------------------------------
    // Broadcast
    // -------------------------------------------------------------------------

    /// Send an ephemeral message to the other users in the room. Throttled
    /// topics collapse to the latest payload per window.
    ///
    /// # Errors
    ///
    /// `SyncError::Inactive` if the handle no longer refers to a live room.
    pub async fn broadcast(
        &self,
        handle: &SubscriptionHandle,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<(), SyncError> {
        self.send(handle, RoomCommand::Broadcast { topic: topic.to_owned(), payload })
            .await
    }

    /// Attach a broadcast handler to an existing lease.
    ///
    /// # Errors
    ///
    /// `SyncError::Inactive` if the handle no longer refers to a live room.
    pub async fn on(
        &self,
        handle: &SubscriptionHandle,
        topic: &str,
        handler: impl FnMut(&BroadcastMessage) + Send + 'static,
    ) -> Result<(), SyncError> {
        let cmd = RoomCommand::OnBroadcast { lease: handle.lease_id, topic: topic.to_owned(), handler: Box::new(handler) };
        self.send(handle, cmd).await
    }

    // -------------------------------------------------------------------------
    // Entities
    // -------------------------------------------------------------------------

    /// Last applied snapshot of an entity.
    ///
    /// # Errors
    ///
    /// `SyncError::Inactive` if the handle no longer refers to a live room.
    pub async fn cached(
        &self,
        handle: &SubscriptionHandle,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<Entity>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(handle, RoomCommand::Cached { entity_type, id: id.to_owned(), reply })
            .await?;
        rx.await.map_err(|_| SyncError::Inactive(handle.room_id.clone()))
    }

    /// Request an immediate reconciliation pass. Ignored while disconnected.
    ///
    /// # Errors
    ///
    /// `SyncError::Inactive` if the handle no longer refers to a live room.
    pub async fn reconcile(&self, handle: &SubscriptionHandle) -> Result<(), SyncError> {
        self.send(handle, RoomCommand::Reconcile).await
    }

    /// Tools permitted at `(x, y)` in the handle's room. Synchronous; uses
    /// the regions loaded when the room first connected.
    #[must_use]
    pub fn tools_at(&self, handle: &SubscriptionHandle, x: f64, y: f64) -> BTreeSet<String> {
        let regions = handle.watches.regions.borrow().clone();
        tool_gate::tools_at(&handle.room_id, x, y, &regions)
    }

    /// Number of live room channels. Rooms still closing are not counted.
    pub async fn open_rooms(&self) -> usize {
        self.inner
            .rooms
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, RoomSlot::Live(_)))
            .count()
    }

    async fn send(&self, handle: &SubscriptionHandle, cmd: RoomCommand) -> Result<(), SyncError> {
        let inactive = || SyncError::Inactive(handle.room_id.clone());
        let commands = {
            let rooms = self.inner.rooms.lock().await;
            let Some(RoomSlot::Live(entry)) = rooms.get(&handle.room_id) else {
                return Err(inactive());
            };
            if entry.subscription_id != handle.subscription_id || !entry.leases.contains(&handle.lease_id) {
                return Err(inactive());
            }
            entry.commands.clone()
        };
        commands.send(cmd).await.map_err(|_| inactive())
    }
}

async fn settled_status(mut rx: watch::Receiver<RoomStatus>) -> RoomStatus {
    if let Ok(status) = rx.wait_for(RoomStatus::is_settled).await {
        return status.clone();
    }
    rx.borrow().clone()
}
