//! Durable storage for document update streams.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐  enqueue   ┌──────────────┐  append_updates
//! │ DocumentSession │ ─────────► │ UpdateWriter │ ──────────────┐
//! └────────┬────────┘            └──────────────┘               ▼
//!          │ snapshot / load                        ┌────────────────────┐
//!          └──────────────────────────────────────► │ PersistenceGateway │
//!                                                   └─────────┬──────────┘
//!                                                             │ spawn_blocking
//!                                                             ▼
//!                                        ┌──────────────────────────────────┐
//!                                        │ KeyValueStore                    │
//!                                        │   MemoryStore | RocksStore       │
//!                                        │   RemoteStore ──► relay hub      │
//!                                        └──────────────────────────────────┘
//! ```

pub mod gateway;
pub mod memory;
pub mod remote;
pub mod rocks;
pub mod store;
pub mod writer;

pub use gateway::{PersistedState, PersistenceGateway, SnapshotRecord};
pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub use rocks::{RocksStore, StoreConfig};
pub use store::{KeyValueStore, RetentionPolicy, StoreError};
pub use writer::{UpdateWriter, WriterConfig};
