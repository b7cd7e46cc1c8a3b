//! Room services driven by the per-room task.
//!
//! ARCHITECTURE
//! ============
//! `channel` is the public entry point. It spawns one `reconnect` task per
//! room, and that task owns the state of every other service here:
//! presence, change dispatch, broadcast throttling, and reconciliation.
//! `tool_gate` is pure and reads the regions the task loads.

pub mod broadcast;
pub mod channel;
pub mod dispatch;
pub mod handlers;
pub mod presence;
pub mod reconcile;
pub mod reconnect;
pub mod throttle;
pub mod tool_gate;
