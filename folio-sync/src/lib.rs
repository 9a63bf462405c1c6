//! # folio-sync: Real-time collaborative document sync engine
//!
//! Many editors open the same document over WebSocket; their concurrent
//! edits are merged with a CRDT, fanned out to everyone else, shared across
//! server processes and persisted so that a restart or a late joiner sees
//! the same state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket   ┌───────────────────┐
//! │ SyncClient  │ ◄───────────► │ SyncServer        │
//! │ (per user)  │  Binary Proto │  ConnectionHandler│
//! └─────────────┘               └─────────┬─────────┘
//!                                         ▼
//!                               ┌───────────────────┐    ┌──────────────┐
//!                               │ SessionRegistry   │    │ FanOutBridge │◄──► LocalHub
//!                               │  DocumentSession  │◄──►│ (origin tag) │◄──► RelayChannel
//!                               │   Replica (yrs)   │    └──────────────┘
//!                               │   AwarenessState  │
//!                               │   BroadcastGroup  │
//!                               └─────────┬─────────┘
//!                                         ▼
//!                               ┌───────────────────┐
//!                               │ PersistenceGateway│──► MemoryStore | RocksStore
//!                               │  UpdateWriter     │──► RemoteStore (served by the relay)
//!                               └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded tagged enums)
//! - [`replica`]: CRDT replica of one document
//! - [`awareness`]: Ephemeral per-user presence
//! - [`session`]: One open document: serialized apply, attach, detach
//! - [`registry`]: Open documents, load on create, idle eviction
//! - [`bridge`]: Cross-process fan-out with loop prevention
//! - [`relay`]: WebSocket relay hub backing the fan-out channel and the shared store
//! - [`persistence`]: Update log, snapshots and active users
//! - [`connection`]: Per-connection protocol state machine
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue
//! - [`health`]: `GET /health`
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Replica apply (single insert) | <5µs |
//! | Frame encode + decode | <1µs |
//! | Session broadcast × 100 peers | <1ms |

pub mod auth;
pub mod awareness;
pub mod bridge;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod health;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod replica;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use auth::{AuthError, Claims, Ed25519Verifier, Identity, TokenVerifier};
pub use awareness::{
    AwarenessRecord, AwarenessState, AwarenessUpdate, CursorColor, Presence, TextSelection,
};
pub use bridge::{
    BridgeConfig, FanOutBridge, FanOutChannel, FanOutError, FanOutKind, FanOutMessage, LocalHub,
    OriginId,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Peer};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig, SessionConfig};
pub use connection::{ConnectionHandler, ConnectionLimits, Control, Phase};
pub use health::HealthReport;
pub use persistence::{
    KeyValueStore, MemoryStore, PersistedState, PersistenceGateway, RemoteStore, RetentionPolicy,
    RocksStore, StoreConfig, StoreError, UpdateWriter,
};
pub use protocol::{ClientMessage, ConnectionId, DocumentId, ErrorCode, ProtocolError, ServerMessage};
pub use registry::SessionRegistry;
pub use relay::{RelayChannel, RelayServer};
pub use replica::{Replica, ReplicaError};
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::{DocumentSession, Origin, SessionError};
