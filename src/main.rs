//! Two collaborators on one roof plan, wired through the in-memory hub.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sitesync::frame::now_ms;
use sitesync::{
    ChangeEvent, ConnectivitySignal, Entity, EntityType, LocalUser, MemoryHub, MemoryStore, Pin, PinStatus,
    Point, PresenceEvent, PresenceRecord, RealtimeManager, RoomHandlers, SyncConfig, SyncError, ToolRegion,
};
use tracing::info;

const ROOM: &str = "roof-1";

fn roof_regions() -> Vec<ToolRegion> {
    let square = |x0: f64, y0: f64, x1: f64, y1: f64| {
        vec![Point::new(x0, y0), Point::new(x1, y0), Point::new(x1, y1), Point::new(x0, y1)]
    };
    vec![
        ToolRegion {
            room_id: ROOM.into(),
            layer_id: "roof".into(),
            polygon: square(0.0, 0.0, 1.0, 1.0),
            allowed_tools: BTreeSet::from(["pin".to_owned(), "measure".to_owned()]),
            denied_tools: BTreeSet::new(),
            priority: 0,
        },
        ToolRegion {
            room_id: ROOM.into(),
            layer_id: "skylight".into(),
            polygon: square(0.4, 0.4, 0.6, 0.6),
            allowed_tools: BTreeSet::from(["annotate".to_owned()]),
            denied_tools: BTreeSet::from(["pin".to_owned()]),
            priority: 10,
        },
    ]
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    tracing_subscriber::fmt::init();

    let config = SyncConfig::from_env();
    let hub = MemoryHub::new();
    let store = MemoryStore::new();
    store.set_regions(ROOM, roof_regions());
    let connectivity = Arc::new(ConnectivitySignal::default());

    let inspector = RealtimeManager::new(
        LocalUser::new("u-inspector", "Inspector"),
        Arc::new(hub.clone()),
        Arc::new(store.clone()),
        connectivity.clone(),
        config.clone(),
    );
    let reviewer = RealtimeManager::new(
        LocalUser::new("u-reviewer", "Reviewer"),
        Arc::new(hub.clone()),
        Arc::new(store.clone()),
        connectivity,
        config,
    );

    let a = inspector.subscribe(ROOM, RoomHandlers::new()).await?;
    let b = reviewer
        .subscribe(
            ROOM,
            RoomHandlers::new()
                .on_presence(|event| match event {
                    PresenceEvent::Sync(users) => info!(users = users.len(), "reviewer presence sync"),
                    PresenceEvent::Cursor { user_id, position } => {
                        info!(%user_id, x = position.x, y = position.y, "reviewer saw cursor");
                    }
                    PresenceEvent::Join(_) | PresenceEvent::Leave(_) => {}
                })
                .on_change(EntityType::Pin, |event| {
                    info!(entity_id = %event.entity_id, operation = ?event.operation(), "reviewer saw pin change");
                }),
        )
        .await?;

    inspector
        .track(&a, PresenceRecord::new("u-inspector", "Inspector").with_tool("pin").with_cursor(0.3, 0.5))
        .await?;
    reviewer
        .track(&b, PresenceRecord::new("u-reviewer", "Reviewer").with_layer("roof"))
        .await?;

    for step in 0..50_u32 {
        let x = 0.3 + f64::from(step) * 0.005;
        inspector.broadcast(&a, "cursor", json!({ "x": x, "y": 0.5 })).await?;
        tokio::time::sleep(Duration::from_millis(4)).await;
    }

    let pin = Pin {
        id: "pin-42".into(),
        x: 0.45,
        y: 0.5,
        status: PinStatus::ReadyForInspection,
        title: Some("Flashing lifted at skylight".into()),
        severity: Some("high".into()),
        layer_id: Some("roof".into()),
        updated_at: now_ms(),
    };
    store.apply(ROOM, &ChangeEvent::upsert(Entity::Pin(pin), true, now_ms()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    info!(tools = ?inspector.tools_at(&a, 0.5, 0.5), "tools over the skylight");
    info!(tools = ?inspector.tools_at(&a, 0.1, 0.1), "tools on open roof");
    info!(
        peers = reviewer.peers(&b).await?.len(),
        cursor_frames = hub.sent_count("broadcast:cursor"),
        "demo finished"
    );

    inspector.unsubscribe(&a).await;
    reviewer.unsubscribe(&b).await;
    Ok(())
}
