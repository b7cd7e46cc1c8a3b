//! Real-time room sync engine.
//!
//! ARCHITECTURE
//! ============
//! A room is one multiplexed channel carrying three traffic classes:
//! durable entity changes, ephemeral presence, and ephemeral broadcasts.
//! `RealtimeManager` keeps at most one channel per room per process and
//! hands out leases on it. Each room runs on its own task, which owns the
//! channel and is the only writer of the room's status.
//!
//! | module                 | role                                         |
//! |------------------------|----------------------------------------------|
//! | `frame`                | wire envelope and syscall routing            |
//! | `types`                | presence, regions, entity snapshots, changes |
//! | `error`                | error taxonomy and codes                     |
//! | `config`               | env-driven tuning knobs                      |
//! | `transport`            | transport / store / connectivity seams       |
//! | `services::channel`    | room channel manager                         |
//! | `services::reconnect`  | backoff state machine and room task          |
//! | `services::dispatch`   | change decoding and last-write-wins cache    |
//! | `services::presence`   | presence map and wire encoding               |
//! | `services::broadcast`  | broadcast wire encoding                      |
//! | `services::throttle`   | trailing-edge send throttle                  |
//! | `services::reconcile`  | store-vs-cache divergence repair             |
//! | `services::tool_gate`  | spatial tool permissions                     |

pub mod config;
pub mod error;
pub mod frame;
pub mod services;
pub mod transport;
pub mod types;

pub use config::SyncConfig;
pub use error::{ChangeDecodeError, ErrorCode, SyncError, TransportError};
pub use frame::Frame;
pub use services::channel::{LocalUser, RealtimeManager, SubscriptionHandle};
pub use services::handlers::RoomHandlers;
pub use services::presence::PresenceEvent;
pub use services::reconnect::{ConnectionState, RoomStatus};
pub use transport::memory::{MemoryHub, MemoryStore};
pub use transport::{Connectivity, ConnectivitySignal, Store, Transport};
pub use types::*;
