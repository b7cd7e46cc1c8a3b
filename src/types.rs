//! Data model shared by every service: presence records, broadcast
//! messages, tool regions, and the typed entity-change union.
//!
//! DESIGN
//! ======
//! Change payloads are a closed union keyed by entity type and operation,
//! so handlers match exhaustively instead of probing JSON fields. Snapshot
//! fields are snake_case on the wire; camelCase aliases are accepted.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Collaboration scope identifier (e.g. `"roof-1"`).
pub type RoomId = String;

/// Stable user identifier; presence is keyed by it.
pub type UserId = String;

// =============================================================================
// GEOMETRY
// =============================================================================

/// A point in normalized canvas space. Both axes are expected in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Clamp into the unit square. NaN collapses to 0.
    #[must_use]
    pub fn clamped(self) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Self { x: clamp(self.x), y: clamp(self.y) }
    }
}

// =============================================================================
// SUBSCRIPTION STATUS
// =============================================================================

/// Status visible on a `SubscriptionHandle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Connecting,
    Subscribed,
    Disconnected,
    Error,
}

// =============================================================================
// PRESENCE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Idle,
    Away,
}

/// Ephemeral per-user state. Keyed by `user_id` within a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    #[serde(alias = "userId")]
    pub user_id: UserId,
    #[serde(default, alias = "displayName")]
    pub display_name: String,
    #[serde(default, alias = "cursorPosition", skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Point>,
    #[serde(default, alias = "selectedTool", skip_serializing_if = "Option::is_none")]
    pub selected_tool: Option<String>,
    #[serde(default, alias = "activeLayerId", skip_serializing_if = "Option::is_none")]
    pub active_layer_id: Option<String>,
    #[serde(default, alias = "lastSeen")]
    pub last_seen: i64,
    #[serde(default)]
    pub status: PresenceStatus,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            cursor: None,
            selected_tool: None,
            active_layer_id: None,
            last_seen: 0,
            status: PresenceStatus::Online,
        }
    }

    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.selected_tool = Some(tool.into());
        self
    }

    #[must_use]
    pub fn with_cursor(mut self, x: f64, y: f64) -> Self {
        self.cursor = Some(Point::new(x, y).clamped());
        self
    }

    #[must_use]
    pub fn with_layer(mut self, layer_id: impl Into<String>) -> Self {
        self.active_layer_id = Some(layer_id.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: PresenceStatus) -> Self {
        self.status = status;
        self
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Best-effort ephemeral message. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub sender_id: UserId,
    pub sent_at: i64,
}

// =============================================================================
// TOOL REGIONS
// =============================================================================

/// Polygon restricting which tools are valid inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegion {
    pub room_id: RoomId,
    pub layer_id: String,
    pub polygon: Vec<Point>,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    #[serde(default)]
    pub denied_tools: BTreeSet<String>,
    #[serde(default)]
    pub priority: i32,
}

// =============================================================================
// ENTITY SNAPSHOTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Pin,
    #[serde(alias = "childPin")]
    ChildPin,
    Layer,
    Annotation,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [Self::Pin, Self::ChildPin, Self::Layer, Self::Annotation];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pin => "pin",
            Self::ChildPin => "child_pin",
            Self::Layer => "layer",
            Self::Annotation => "annotation",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pin" => Some(Self::Pin),
            "child_pin" | "childPin" => Some(Self::ChildPin),
            "layer" => Some(Self::Layer),
            "annotation" => Some(Self::Annotation),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(alias = "insert", alias = "INSERT")]
    Insert,
    #[serde(alias = "update", alias = "UPDATE")]
    Update,
    #[serde(alias = "delete", alias = "DELETE")]
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinStatus {
    #[default]
    Open,
    ReadyForInspection,
    ReadyForReview,
    Closed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub status: PinStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, alias = "layerId", skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<String>,
    #[serde(alias = "updatedAt", deserialize_with = "timestamp_ms")]
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildPin {
    pub id: String,
    #[serde(alias = "parentPinId")]
    pub parent_pin_id: String,
    #[serde(default)]
    pub status: PinStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(alias = "updatedAt", deserialize_with = "timestamp_ms")]
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default, alias = "zOrder")]
    pub z_order: i32,
    #[serde(alias = "updatedAt", deserialize_with = "timestamp_ms")]
    pub updated_at: i64,
}

fn default_visible() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    #[serde(alias = "layerId")]
    pub layer_id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(alias = "updatedAt", deserialize_with = "timestamp_ms")]
    pub updated_at: i64,
}

// =============================================================================
// TIMESTAMPS
// =============================================================================

/// Wire timestamps arrive either as epoch milliseconds or as RFC 3339 text
/// (`2024-05-01T12:00:00.123Z`), depending on the feed.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Text(String),
}

impl RawTimestamp {
    fn into_millis<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Self::Millis(ms) => Ok(ms),
            Self::Text(text) => parse_rfc3339_ms(&text).ok_or_else(|| E::custom(format!("invalid timestamp: {text}"))),
        }
    }
}

/// Epoch milliseconds for an RFC 3339 timestamp. Sub-millisecond digits are
/// truncated.
#[must_use]
pub fn parse_rfc3339_ms(text: &str) -> Option<i64> {
    let at = OffsetDateTime::parse(text, &Rfc3339).ok()?;
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).ok()
}

pub(crate) fn timestamp_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    RawTimestamp::deserialize(deserializer)?.into_millis()
}

pub(crate) fn timestamp_ms_opt<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Option::<RawTimestamp>::deserialize(deserializer)?
        .map(RawTimestamp::into_millis)
        .transpose()
}

/// Common surface of the four snapshot types.
pub trait Snapshot: Clone + Serialize + DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;
    fn updated_at(&self) -> i64;
    fn into_entity(self) -> Entity;
}

macro_rules! impl_snapshot {
    ($ty:ident, $variant:ident) => {
        impl Snapshot for $ty {
            const ENTITY_TYPE: EntityType = EntityType::$variant;

            fn id(&self) -> &str {
                &self.id
            }

            fn updated_at(&self) -> i64 {
                self.updated_at
            }

            fn into_entity(self) -> Entity {
                Entity::$variant(self)
            }
        }
    };
}

impl_snapshot!(Pin, Pin);
impl_snapshot!(ChildPin, ChildPin);
impl_snapshot!(Layer, Layer);
impl_snapshot!(Annotation, Annotation);

/// Any cached entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum Entity {
    Pin(Pin),
    ChildPin(ChildPin),
    Layer(Layer),
    Annotation(Annotation),
}

impl Entity {
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Pin(_) => EntityType::Pin,
            Self::ChildPin(_) => EntityType::ChildPin,
            Self::Layer(_) => EntityType::Layer,
            Self::Annotation(_) => EntityType::Annotation,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Pin(e) => &e.id,
            Self::ChildPin(e) => &e.id,
            Self::Layer(e) => &e.id,
            Self::Annotation(e) => &e.id,
        }
    }

    #[must_use]
    pub fn updated_at(&self) -> i64 {
        match self {
            Self::Pin(e) => e.updated_at,
            Self::ChildPin(e) => e.updated_at,
            Self::Layer(e) => e.updated_at,
            Self::Annotation(e) => e.updated_at,
        }
    }

    #[must_use]
    pub fn as_pin(&self) -> Option<&Pin> {
        match self {
            Self::Pin(p) => Some(p),
            _ => None,
        }
    }
}

// =============================================================================
// CHANGE EVENTS
// =============================================================================

/// One durable mutation of a single entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Insert { after: T },
    Update { before: Option<T>, after: T },
    Delete { before: Option<T> },
}

impl<T> Change<T> {
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::Insert { .. } => Operation::Insert,
            Self::Update { .. } => Operation::Update,
            Self::Delete { .. } => Operation::Delete,
        }
    }

    #[must_use]
    pub fn after(&self) -> Option<&T> {
        match self {
            Self::Insert { after } | Self::Update { after, .. } => Some(after),
            Self::Delete { .. } => None,
        }
    }

    #[must_use]
    pub fn before(&self) -> Option<&T> {
        match self {
            Self::Insert { .. } => None,
            Self::Update { before, .. } | Self::Delete { before } => before.as_ref(),
        }
    }
}

/// Closed union over entity type × operation.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    Pin(Change<Pin>),
    ChildPin(Change<ChildPin>),
    Layer(Change<Layer>),
    Annotation(Change<Annotation>),
}

impl EntityChange {
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Pin(_) => EntityType::Pin,
            Self::ChildPin(_) => EntityType::ChildPin,
            Self::Layer(_) => EntityType::Layer,
            Self::Annotation(_) => EntityType::Annotation,
        }
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::Pin(c) => c.operation(),
            Self::ChildPin(c) => c.operation(),
            Self::Layer(c) => c.operation(),
            Self::Annotation(c) => c.operation(),
        }
    }

    /// The post-change snapshot as a cacheable entity. `None` for deletes.
    #[must_use]
    pub fn after_entity(&self) -> Option<Entity> {
        match self {
            Self::Pin(c) => c.after().cloned().map(Entity::Pin),
            Self::ChildPin(c) => c.after().cloned().map(Entity::ChildPin),
            Self::Layer(c) => c.after().cloned().map(Entity::Layer),
            Self::Annotation(c) => c.after().cloned().map(Entity::Annotation),
        }
    }

    #[must_use]
    pub fn before_entity(&self) -> Option<Entity> {
        match self {
            Self::Pin(c) => c.before().cloned().map(Entity::Pin),
            Self::ChildPin(c) => c.before().cloned().map(Entity::ChildPin),
            Self::Layer(c) => c.before().cloned().map(Entity::Layer),
            Self::Annotation(c) => c.before().cloned().map(Entity::Annotation),
        }
    }
}

/// A change-feed notification after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub change: EntityChange,
    pub entity_id: String,
    pub occurred_at: i64,
    pub origin_user_id: Option<UserId>,
}

impl ChangeEvent {
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        self.change.entity_type()
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.change.operation()
    }

    /// Build an insert-or-update event from a full snapshot, as the
    /// reconciler does when it finds a newer or missing entity.
    #[must_use]
    pub fn upsert(entity: Entity, insert: bool, occurred_at: i64) -> Self {
        let entity_id = entity.id().to_owned();
        let change = match (entity, insert) {
            (Entity::Pin(after), true) => EntityChange::Pin(Change::Insert { after }),
            (Entity::Pin(after), false) => EntityChange::Pin(Change::Update { before: None, after }),
            (Entity::ChildPin(after), true) => EntityChange::ChildPin(Change::Insert { after }),
            (Entity::ChildPin(after), false) => EntityChange::ChildPin(Change::Update { before: None, after }),
            (Entity::Layer(after), true) => EntityChange::Layer(Change::Insert { after }),
            (Entity::Layer(after), false) => EntityChange::Layer(Change::Update { before: None, after }),
            (Entity::Annotation(after), true) => EntityChange::Annotation(Change::Insert { after }),
            (Entity::Annotation(after), false) => EntityChange::Annotation(Change::Update { before: None, after }),
        };
        Self { change, entity_id, occurred_at, origin_user_id: None }
    }

    /// Build a delete event carrying the last known snapshot.
    #[must_use]
    pub fn removal(entity: Entity, occurred_at: i64) -> Self {
        let entity_id = entity.id().to_owned();
        let change = match entity {
            Entity::Pin(before) => EntityChange::Pin(Change::Delete { before: Some(before) }),
            Entity::ChildPin(before) => EntityChange::ChildPin(Change::Delete { before: Some(before) }),
            Entity::Layer(before) => EntityChange::Layer(Change::Delete { before: Some(before) }),
            Entity::Annotation(before) => EntityChange::Annotation(Change::Delete { before: Some(before) }),
        };
        Self { change, entity_id, occurred_at, origin_user_id: None }
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
