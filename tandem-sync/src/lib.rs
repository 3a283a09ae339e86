//! # tandem-sync: real-time multiplayer sync rooms
//!
//! A room holds the authoritative records of one shared document. Clients
//! push mutations, the room applies them in arrival order (last writer wins
//! per record), stamps them with a monotonic clock, and streams patches to
//! every other connected client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ReplicaStore │                     │RoomRegistry │
//! │ (local)     │                     │ doc → Room  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ Room          │
//!                                    │ RecordStore + │
//!                                    │ Sessions      │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`]: Records, record types and schema validation
//! - [`diff`]: Record diffs, patches and the client-side replica
//! - [`store`]: Authoritative clocked record store with tombstones
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`session`]: Per-connection state machine and debounced outbox
//! - [`socket`]: Transport seam between rooms and connections
//! - [`room`]: The room state machine
//! - [`registry`]: Document routing and room lifetimes
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod config;
pub mod record;
pub mod diff;
pub mod store;
pub mod protocol;
pub mod session;
pub mod socket;
pub mod room;
pub mod registry;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use config::RoomConfig;
pub use record::{
    FieldKind, Record, RecordContent, RecordId, RecordScope, RecordType, Schema,
    SchemaDescriptor, SchemaMismatch, ValidationError, PRESENCE_TYPE,
};
pub use diff::{Patch, RecordOp, RecordsDiff, ReplicaError, ReplicaStore};
pub use store::{ApplyOutcome, RecordStore, RoomSnapshot};
pub use protocol::{
    ClientMessage, ConnectAccepted, ConnectRequest, DataMessage, Hydration, Mutation,
    MutationOp, ProtocolError, Push, PushResult, RejectReason, RejectedMutation, ServerMessage,
};
pub use session::{Session, SessionState};
pub use socket::{ChannelSocket, MemorySocket, RoomSocket, SocketError};
pub use room::{CancelCause, LifecycleEvent, RemovalCause, Room, RoomError};
pub use registry::{MemorySnapshotStore, RoomRegistry, SharedRoom, SnapshotStore};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
