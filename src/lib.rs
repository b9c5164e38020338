//! # loro-hub — WebSocket relay and state-keeper for Loro documents
//!
//! Synchronizes CRDT-backed documents across many concurrent clients. The
//! hub keeps an authoritative replica per document, answers initial-sync
//! requests with version-vector-diffed batches, fans incremental updates
//! out to every sibling connection, and relays ephemeral (presence) state
//! without ever persisting it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      WebSocket      ┌─────────────┐
//! │  Provider   │ ◄─────────────────► │  HubServer  │
//! │ (per doc)   │    framed binary    │  (central)  │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Replica     │                     │ Document    │
//! │ (local)     │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                 ┌──────────┼──────────┐
//!                                 ▼          ▼          ▼
//!                              fanout     registry   storage
//!                           (origin-elided) (unload)  (coalesced)
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — varint wire primitives (LEB128, varstring, varbytes)
//! - [`protocol`] — the five framed message kinds
//! - [`engine`] — CRDT capability trait + the loro adapter
//! - [`connection`] — per-peer send queue, close codes, attachments
//! - [`document`] — authoritative state, sync, fanout, persist coalescing
//! - [`registry`] — load-on-demand, refcounting, idle unload
//! - [`server`] — the accept loop and frame dispatch
//! - [`storage`] — persistence hooks + in-memory backend
//! - [`auth`] — token sources and the admission hook
//! - [`ephemeral`] — presence store contract + keyed LWW store
//! - [`transport`] — shared client socket, refcounted by providers
//! - [`provider`] — client-side binding of one document to one socket

pub mod auth;
pub mod codec;
pub mod connection;
pub mod document;
pub mod engine;
pub mod ephemeral;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod server;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use auth::{AllowAll, AuthDecision, AuthScope, AuthToken, Authenticator};
pub use connection::{CloseCode, Connection, ConnectionId, ConnectionState};
pub use document::{ConnectionPredicate, Document, PersistOptions, UpdateHook};
pub use engine::{
    EngineError, ImportStatus, LocalSubscription, LoroReplica, Replica, ReplicaFactory,
    VersionVector,
};
pub use ephemeral::{EphemeralStore, KeyedEphemeralStore};
pub use protocol::{AuthCode, Direction, FrameLimits, Message, ProtocolError};
pub use provider::{Provider, ProviderEvent, ProviderOptions};
pub use registry::{DocumentRegistry, RegistryOptions};
pub use server::{HubConfig, HubServer, HubStats};
pub use storage::{DocumentSource, MemoryStorage, Storage, StorageError};
pub use transport::{SharedTransport, TransportError, TransportEvent, TransportStatus};
