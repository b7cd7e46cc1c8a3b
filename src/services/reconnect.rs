//! Reconnection controller: the only component that opens or closes a
//! room's channel.
//!
//! ARCHITECTURE
//! ============
//! One supervisor task per room. It owns the transport channel, the change
//! feed, and every piece of per-room state (presence, entity cache,
//! throttle, handler registry). Everything else talks to it through a
//! bounded command queue, so handlers run one at a time on this task and
//! the task is the sole writer of the room's status.
//!
//! STATE MACHINE
//! =============
//! ```text
//! Idle --subscribe--> Connecting --subscribed--> Connected
//! Connecting|Connected --error|offline--> Backoff
//! Backoff --delay elapsed|online--> Connecting        (attempt += 1)
//! any --unsubscribe|fatal--> Disconnected             (terminal)
//! ```
//! delay = min(max, base × 2^attempt); attempt resets on Connected. An
//! online signal while Connected is a no-op. While offline no connect
//! attempt is made.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::frame::{Frame, Route};
use crate::services::broadcast::{self, TOPIC_CURSOR};
use crate::services::dispatch::ChangeDispatcher;
use crate::services::handlers::{BroadcastHandler, HandlerRegistry, RoomHandlers};
use crate::services::presence::{self, PresenceEvent, PresenceTracker};
use crate::services::reconcile;
use crate::services::throttle::Throttle;
use crate::transport::{ChangeFeed, ChannelEvent, ChannelSender, OpenedChannel, Store, Transport};
use crate::types::{Entity, EntityType, PresenceRecord, RoomId, SubscriptionStatus, ToolRegion, UserId};

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Backoff,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    Subscribe,
    TransportSubscribed,
    TransportError,
    ConnectivityLost,
    ConnectivityRestored,
    BackoffElapsed,
    Unsubscribe,
    /// Permanent failure (e.g. access denied). Terminal like `Unsubscribe`.
    Fatal,
}

/// Pure reconnect state machine. Holds no I/O so it can be tested alone.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    state: ConnectionState,
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl ReconnectController {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { state: ConnectionState::Idle, attempt: 0, base, max }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait in the current Backoff cycle.
    #[must_use]
    pub fn delay(&self) -> Duration {
        backoff_delay(self.base, self.max, self.attempt)
    }

    /// Apply an event. Returns `(from, to)` when the state moved, `None`
    /// when the event does not apply in the current state.
    pub fn handle(&mut self, event: ControllerEvent) -> Option<(ConnectionState, ConnectionState)> {
        use ConnectionState as S;
        use ControllerEvent as E;

        let from = self.state;
        let to = match (from, event) {
            (S::Disconnected, _) => return None,
            (_, E::Unsubscribe | E::Fatal) => S::Disconnected,
            (S::Idle, E::Subscribe) => S::Connecting,
            (S::Connecting, E::TransportSubscribed) => {
                self.attempt = 0;
                S::Connected
            }
            (S::Connecting | S::Connected, E::TransportError | E::ConnectivityLost) => S::Backoff,
            (S::Backoff, E::BackoffElapsed | E::ConnectivityRestored) => {
                self.attempt = self.attempt.saturating_add(1);
                S::Connecting
            }
            _ => return None,
        };
        self.state = to;
        Some((from, to))
    }
}

/// `min(max, base × 2^attempt)`, saturating.
#[must_use]
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

// =============================================================================
// ROOM STATUS
// =============================================================================

/// Everything the UI may observe about a room subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomStatus {
    pub status: SubscriptionStatus,
    pub state: ConnectionState,
    pub attempt: u32,
    pub ever_connected: bool,
    pub last_error: Option<SyncError>,
}

impl RoomStatus {
    /// Whether a waiting `subscribe` call has its answer. A room that has
    /// connected before answers immediately even while it reconnects.
    pub(crate) fn is_settled(&self) -> bool {
        self.ever_connected || self.status != SubscriptionStatus::Connecting
    }
}

fn status_for(state: ConnectionState, fatal: bool) -> SubscriptionStatus {
    match state {
        ConnectionState::Idle | ConnectionState::Connecting => SubscriptionStatus::Connecting,
        ConnectionState::Connected => SubscriptionStatus::Subscribed,
        ConnectionState::Backoff => SubscriptionStatus::Error,
        ConnectionState::Disconnected if fatal => SubscriptionStatus::Error,
        ConnectionState::Disconnected => SubscriptionStatus::Disconnected,
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

pub(crate) enum RoomCommand {
    AddHandlers { lease: Uuid, handlers: RoomHandlers },
    RemoveLease { lease: Uuid },
    OnBroadcast { lease: Uuid, topic: String, handler: BroadcastHandler },
    Track(PresenceRecord),
    Untrack,
    Broadcast { topic: String, payload: serde_json::Value },
    Reconcile,
    Presence(oneshot::Sender<Vec<PresenceRecord>>),
    Cached { entity_type: EntityType, id: String, reply: oneshot::Sender<Option<Entity>> },
    Shutdown,
}

/// Fixed inputs of a room task.
pub(crate) struct RoomContext {
    pub(crate) room_id: RoomId,
    pub(crate) user_id: UserId,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: SyncConfig,
    pub(crate) status_tx: watch::Sender<RoomStatus>,
    pub(crate) users_tx: watch::Sender<usize>,
    pub(crate) regions_tx: watch::Sender<Arc<Vec<ToolRegion>>>,
}

/// Receivers the task selects on, kept outside `RoomTask` so handler
/// bodies can borrow the task mutably while these are being polled.
pub(crate) struct RoomInputs {
    pub(crate) commands: mpsc::Receiver<RoomCommand>,
    pub(crate) online: watch::Receiver<bool>,
    pub(crate) online_alive: bool,
}

impl RoomInputs {
    fn is_online(&self) -> bool {
        !self.online_alive || *self.online.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Loss {
    Transport(TransportError),
    Offline,
}

// =============================================================================
// CONNECTION
// =============================================================================

struct Connection {
    sender: Box<dyn ChannelSender>,
    events: mpsc::Receiver<ChannelEvent>,
    feed: ChangeFeed,
    /// Frames that arrived before the transport confirmed the subscription.
    buffered: Vec<Frame>,
}

/// Owned copy of what a connect attempt needs, so the attempt can run
/// while the task keeps serving commands.
struct Opener {
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    channel_name: String,
    room_id: RoomId,
    user_id: UserId,
    timeout: Duration,
}

impl Opener {
    async fn open(self) -> Result<Connection, TransportError> {
        let opened = tokio::time::timeout(self.timeout, self.transport.open_channel(&self.channel_name, &self.user_id))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let OpenedChannel { sender, mut events } = opened;

        let mut buffered = Vec::new();
        let confirm = async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Subscribed) => return Ok(()),
                    Some(ChannelEvent::Frame(frame)) => buffered.push(frame),
                    Some(ChannelEvent::Error(e)) => return Err(e),
                    Some(ChannelEvent::Closed) | None => return Err(TransportError::Closed),
                }
            }
        };
        let confirmed = tokio::time::timeout(self.timeout, confirm)
            .await
            .unwrap_or(Err(TransportError::Timeout));
        if let Err(e) = confirmed {
            sender.close().await;
            return Err(e);
        }

        let feed = match self
            .store
            .change_feed(&self.room_id, &EntityType::ALL)
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                sender.close().await;
                return Err(e);
            }
        };

        Ok(Connection { sender, events, feed, buffered })
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A store fetch for reconciliation, polled by the live loop alongside
/// channel traffic.
type PendingFetch = BoxFuture<'static, Result<Vec<Entity>, TransportError>>;

async fn fetch_opt(fetch: &mut Option<PendingFetch>) -> Result<Vec<Entity>, TransportError> {
    match fetch {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// =============================================================================
// ROOM TASK
// =============================================================================

/// Run a room until it is unsubscribed or fails permanently.
pub(crate) async fn run_room(ctx: RoomContext, mut inputs: RoomInputs, lease: Uuid, handlers: RoomHandlers) {
    let mut task = RoomTask::new(ctx);
    task.registry.add(lease, handlers);
    task.transition(ControllerEvent::Subscribe);

    loop {
        let flow = match task.controller.state() {
            ConnectionState::Connecting => task.connecting(&mut inputs).await,
            ConnectionState::Backoff => task.backing_off(&mut inputs).await,
            ConnectionState::Idle | ConnectionState::Connected | ConnectionState::Disconnected => Flow::Stop,
        };
        if flow == Flow::Stop {
            break;
        }
    }
    debug!(room_id = %task.ctx.room_id, "room task exited");
}

struct RoomTask {
    ctx: RoomContext,
    controller: ReconnectController,
    presence: PresenceTracker,
    dispatcher: ChangeDispatcher,
    throttle: Throttle<serde_json::Value>,
    registry: HandlerRegistry,
    regions_loaded: bool,
    ever_connected: bool,
    fatal: bool,
    last_error: Option<SyncError>,
    reconcile_wanted: bool,
    /// Entities the feed changed while a reconcile fetch was in flight. The
    /// fetched snapshot may predate them, so the diff leaves them alone.
    changed_during_fetch: Option<HashSet<(EntityType, String)>>,
}

impl RoomTask {
    fn new(ctx: RoomContext) -> Self {
        Self {
            controller: ReconnectController::new(ctx.config.backoff_base, ctx.config.backoff_max),
            presence: PresenceTracker::new(ctx.user_id.clone()),
            dispatcher: ChangeDispatcher::new(),
            throttle: Throttle::new(ctx.config.throttle_window),
            registry: HandlerRegistry::default(),
            regions_loaded: false,
            ever_connected: false,
            fatal: false,
            last_error: None,
            reconcile_wanted: false,
            changed_during_fetch: None,
            ctx,
        }
    }

    // -------------------------------------------------------------------------
    // Phases
    // -------------------------------------------------------------------------

    async fn connecting(&mut self, inputs: &mut RoomInputs) -> Flow {
        if !inputs.is_online() {
            return self.lose(Loss::Offline);
        }

        info!(room_id = %self.ctx.room_id, attempt = self.controller.attempt(), "opening room channel");
        let opener = Opener {
            transport: self.ctx.transport.clone(),
            store: self.ctx.store.clone(),
            channel_name: self.ctx.config.channel_name(&self.ctx.room_id),
            room_id: self.ctx.room_id.clone(),
            user_id: self.ctx.user_id.clone(),
            timeout: self.ctx.config.connect_timeout,
        };
        let connect = opener.open();
        tokio::pin!(connect);

        let result = loop {
            tokio::select! {
                res = &mut connect => break res.map_err(Loss::Transport),
                cmd = inputs.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return self.shutdown(None).await;
                    };
                    if self.handle_command(cmd, None).await == Flow::Stop {
                        return self.shutdown(None).await;
                    }
                }
                changed = inputs.online.changed(), if inputs.online_alive => {
                    if changed.is_err() {
                        inputs.online_alive = false;
                    } else if !*inputs.online.borrow_and_update() {
                        break Err(Loss::Offline);
                    }
                }
            }
        };

        match result {
            Ok(conn) => {
                self.last_error = None;
                self.ever_connected = true;
                self.transition(ControllerEvent::TransportSubscribed);
                self.live(conn, inputs).await
            }
            Err(loss) => self.lose(loss),
        }
    }

    async fn live(&mut self, conn: Connection, inputs: &mut RoomInputs) -> Flow {
        let Connection { sender, mut events, mut feed, buffered } = conn;
        let sender: &dyn ChannelSender = &*sender;

        self.on_connected(sender).await;
        for frame in buffered {
            self.handle_inbound(&frame);
        }

        let mut reconcile_timer = self.ctx.config.reconcile_interval.map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut fetch: Option<PendingFetch> = None;

        let loss = loop {
            if self.reconcile_wanted && fetch.is_none() {
                fetch = Some(self.start_fetch());
            }
            let throttle_due = self.throttle.next_due();
            tokio::select! {
                event = events.recv() => match event {
                    Some(ChannelEvent::Frame(frame)) => self.handle_inbound(&frame),
                    Some(ChannelEvent::Subscribed) => {}
                    Some(ChannelEvent::Error(e)) => break Loss::Transport(e),
                    Some(ChannelEvent::Closed) | None => break Loss::Transport(TransportError::Closed),
                },
                frame = feed.next() => match frame {
                    Some(frame) => self.handle_change_frame(&frame),
                    None => break Loss::Transport(TransportError::Disconnected("change feed ended".into())),
                },
                cmd = inputs.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return self.shutdown(Some(sender)).await;
                    };
                    if self.handle_command(cmd, Some(sender)).await == Flow::Stop {
                        return self.shutdown(Some(sender)).await;
                    }
                }
                () = sleep_until_opt(throttle_due) => self.flush_throttle(sender).await,
                () = tick_opt(&mut reconcile_timer) => {
                    self.reconcile_wanted = true;
                }
                fetched = fetch_opt(&mut fetch) => {
                    fetch = None;
                    self.finish_reconcile(fetched);
                }
                changed = inputs.online.changed(), if inputs.online_alive => {
                    if changed.is_err() {
                        inputs.online_alive = false;
                    } else if !*inputs.online.borrow_and_update() {
                        break Loss::Offline;
                    }
                }
            }
        };

        sender.close().await;
        self.lose(loss)
    }

    async fn backing_off(&mut self, inputs: &mut RoomInputs) -> Flow {
        let delay = self.controller.delay();
        let deadline = Instant::now() + delay;
        info!(
            room_id = %self.ctx.room_id,
            attempt = self.controller.attempt(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "backing off before reconnect"
        );

        loop {
            let online = inputs.is_online();
            tokio::select! {
                () = tokio::time::sleep_until(deadline), if online => {
                    self.transition(ControllerEvent::BackoffElapsed);
                    return Flow::Continue;
                }
                cmd = inputs.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return self.shutdown(None).await;
                    };
                    if self.handle_command(cmd, None).await == Flow::Stop {
                        return self.shutdown(None).await;
                    }
                }
                changed = inputs.online.changed(), if inputs.online_alive => {
                    if changed.is_err() {
                        inputs.online_alive = false;
                    } else if *inputs.online.borrow_and_update() {
                        info!(room_id = %self.ctx.room_id, "connectivity restored; reconnecting now");
                        self.transition(ControllerEvent::ConnectivityRestored);
                        return Flow::Continue;
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self, sender: Option<&dyn ChannelSender>) -> Flow {
        if let Some(sender) = sender {
            if self.presence.own().is_some() {
                if let Err(e) = sender.untrack().await {
                    debug!(room_id = %self.ctx.room_id, error = %e, "untrack on shutdown failed");
                }
            }
            sender.close().await;
        }
        let abandoned = self.throttle.clear();
        self.transition(ControllerEvent::Unsubscribe);
        info!(room_id = %self.ctx.room_id, abandoned, "room channel closed");
        Flow::Stop
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn transition(&mut self, event: ControllerEvent) {
        if let Some((from, to)) = self.controller.handle(event) {
            debug!(room_id = %self.ctx.room_id, ?from, ?to, ?event, "connection state changed");
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let state = self.controller.state();
        self.ctx.status_tx.send_replace(RoomStatus {
            status: status_for(state, self.fatal),
            state,
            attempt: self.controller.attempt(),
            ever_connected: self.ever_connected,
            last_error: self.last_error.clone(),
        });
    }

    fn publish_users(&self) {
        let count = self.presence.map().len();
        self.ctx.users_tx.send_if_modified(|current| {
            if *current == count {
                return false;
            }
            *current = count;
            true
        });
    }

    /// Record a lost or failed connection and move to Backoff, or tear the
    /// room down if the failure is permanent.
    fn lose(&mut self, loss: Loss) -> Flow {
        let abandoned = self.throttle.clear();
        let (event, err) = match loss {
            Loss::Offline => (
                ControllerEvent::ConnectivityLost,
                SyncError::Connection { room_id: self.ctx.room_id.clone(), reason: "connectivity lost".into() },
            ),
            Loss::Transport(e) if e.is_fatal() => {
                let err = SyncError::from_transport(&self.ctx.room_id, &e);
                error!(room_id = %self.ctx.room_id, error = %err, "room subscription rejected");
                self.fatal = true;
                self.last_error = Some(err.clone());
                self.transition(ControllerEvent::Fatal);
                self.registry.emit_error(&err);
                return Flow::Stop;
            }
            Loss::Transport(e) => (ControllerEvent::TransportError, SyncError::from_transport(&self.ctx.room_id, &e)),
        };

        warn!(room_id = %self.ctx.room_id, error = %err, abandoned, "room channel lost");
        self.last_error = Some(err.clone());
        self.transition(event);
        self.registry.emit_error(&err);
        Flow::Continue
    }

    async fn on_connected(&mut self, sender: &dyn ChannelSender) {
        info!(room_id = %self.ctx.room_id, "room channel subscribed");

        if let Some(own) = self.presence.own().cloned() {
            let record = self.presence.prepare_track(own);
            if let Err(e) = sender.track(&record).await {
                warn!(room_id = %self.ctx.room_id, error = %e, "re-track after reconnect failed");
            }
        }

        if !self.regions_loaded {
            match self.ctx.store.query_regions(&self.ctx.room_id).await {
                Ok(regions) => {
                    info!(room_id = %self.ctx.room_id, count = regions.len(), "tool regions loaded");
                    self.ctx.regions_tx.send_replace(Arc::new(regions));
                    self.regions_loaded = true;
                }
                Err(e) => warn!(room_id = %self.ctx.room_id, error = %e, "tool region query failed"),
            }
        }

        self.changed_during_fetch = None;
        self.reconcile_wanted = true;
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    fn handle_inbound(&mut self, frame: &Frame) {
        match frame.route() {
            Route::Presence => self.handle_presence(frame),
            Route::Broadcast => self.handle_broadcast(frame),
            Route::Change => self.handle_change_frame(frame),
            Route::Unknown => debug!(room_id = %self.ctx.room_id, syscall = %frame.syscall, "ignoring frame"),
        }
    }

    fn handle_presence(&mut self, frame: &Frame) {
        match presence::decode(frame) {
            Ok(decoded) => {
                let event = self.presence.apply(decoded);
                self.registry.emit_presence(&event);
                self.publish_users();
            }
            Err(reason) => warn!(room_id = %self.ctx.room_id, %reason, "dropping malformed presence frame"),
        }
    }

    fn handle_broadcast(&mut self, frame: &Frame) {
        let message = match broadcast::decode(frame) {
            Ok(m) => m,
            Err(reason) => {
                let err = SyncError::BroadcastFailure { topic: frame.suffix().to_owned(), reason };
                warn!(room_id = %self.ctx.room_id, error = %err, "dropping broadcast");
                return;
            }
        };
        if message.sender_id == self.ctx.user_id {
            return;
        }

        if message.topic == TOPIC_CURSOR {
            if let Some(position) = broadcast::cursor_position(&message.payload) {
                if let Some(event) = self
                    .presence
                    .merge_cursor(&message.sender_id, position, message.sent_at)
                {
                    self.registry.emit_presence(&event);
                }
            }
        }
        self.registry.emit_broadcast(&message);
    }

    fn handle_change_frame(&mut self, frame: &Frame) {
        match self.dispatcher.handle_frame(frame) {
            Ok(Some(event)) => {
                if let Some(changed) = &mut self.changed_during_fetch {
                    changed.insert((event.entity_type(), event.entity_id.clone()));
                }
                self.registry.emit_change(&event);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(room_id = %self.ctx.room_id, error = %e, "skipping undecodable change event");
                self.registry.emit_error(&SyncError::from(e));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: RoomCommand, sender: Option<&dyn ChannelSender>) -> Flow {
        match cmd {
            RoomCommand::AddHandlers { lease, handlers } => {
                let wants_presence = self.registry.add(lease, handlers);
                debug!(room_id = %self.ctx.room_id, %lease, leases = self.registry.len(), "handlers attached");
                if wants_presence && self.controller.state() == ConnectionState::Connected {
                    let snapshot = PresenceEvent::Sync(self.presence.map().all());
                    self.registry.emit_presence_to(lease, &snapshot);
                }
            }
            RoomCommand::RemoveLease { lease } => self.registry.remove(lease),
            RoomCommand::OnBroadcast { lease, topic, handler } => self.registry.add_broadcast(lease, topic, handler),
            RoomCommand::Track(record) => {
                let record = self.presence.prepare_track(record);
                if let Some(sender) = sender {
                    if let Err(e) = sender.track(&record).await {
                        warn!(room_id = %self.ctx.room_id, error = %e, "presence track failed");
                    }
                }
            }
            RoomCommand::Untrack => {
                self.presence.clear_own();
                if let Some(sender) = sender {
                    if let Err(e) = sender.untrack().await {
                        warn!(room_id = %self.ctx.room_id, error = %e, "presence untrack failed");
                    }
                }
            }
            RoomCommand::Broadcast { topic, payload } => self.broadcast(sender, topic, payload).await,
            RoomCommand::Reconcile => {
                if sender.is_some() {
                    self.reconcile_wanted = true;
                }
            }
            RoomCommand::Presence(reply) => {
                let _ = reply.send(self.presence.map().all());
            }
            RoomCommand::Cached { entity_type, id, reply } => {
                let _ = reply.send(self.dispatcher.cache().get(entity_type, &id).cloned());
            }
            RoomCommand::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    async fn broadcast(&mut self, sender: Option<&dyn ChannelSender>, topic: String, payload: serde_json::Value) {
        let Some(sender) = sender else {
            let err = SyncError::BroadcastFailure { topic, reason: "room channel not connected".into() };
            warn!(room_id = %self.ctx.room_id, error = %err, "dropping broadcast");
            return;
        };
        if self.ctx.config.is_throttled(&topic) {
            self.throttle.offer_at(&topic, payload, Instant::now());
            return;
        }
        self.send_broadcast(sender, &topic, payload).await;
    }

    async fn flush_throttle(&mut self, sender: &dyn ChannelSender) {
        for (topic, payload, collapsed) in self.throttle.take_due_at(Instant::now()) {
            debug!(room_id = %self.ctx.room_id, %topic, collapsed, "flushing throttled broadcast");
            self.send_broadcast(sender, &topic, payload).await;
        }
    }

    async fn send_broadcast(&mut self, sender: &dyn ChannelSender, topic: &str, payload: serde_json::Value) {
        let frame = broadcast::encode(topic, payload, &self.ctx.user_id).with_room_id(self.ctx.room_id.clone());
        if let Err(e) = sender.send(frame).await {
            let err = SyncError::BroadcastFailure { topic: topic.to_owned(), reason: e.to_string() };
            warn!(room_id = %self.ctx.room_id, error = %err, "broadcast dropped");
        }
    }

    fn start_fetch(&mut self) -> PendingFetch {
        self.reconcile_wanted = false;
        self.changed_during_fetch = Some(HashSet::new());
        let store = self.ctx.store.clone();
        let room_id = self.ctx.room_id.clone();
        Box::pin(async move { store.fetch_entities(&room_id).await })
    }

    fn finish_reconcile(&mut self, fetched: Result<Vec<Entity>, TransportError>) {
        let changed = self.changed_during_fetch.take().unwrap_or_default();
        let fresh = match fetched {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(room_id = %self.ctx.room_id, error = %e, "reconciliation fetch failed");
                return;
            }
        };

        let mut repairs = reconcile::diff(self.dispatcher.cache(), fresh);
        repairs.retain(|event| !changed.contains(&(event.entity_type(), event.entity_id.clone())));
        if !repairs.is_empty() {
            info!(room_id = %self.ctx.room_id, repairs = repairs.len(), "reconciliation repaired divergence");
        }
        for event in repairs {
            if let Some(event) = self.dispatcher.apply(event) {
                self.registry.emit_change(&event);
            }
        }
    }
}

#[cfg(test)]
#[path = "reconnect_test.rs"]
mod tests;
