//! # tandem-collab: shared document sessions over WebSocket
//!
//! Runs one actor per open document on top of the `tandem-core` kernel,
//! tracks who is present, fans committed operations out to participants and
//! persists history in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  WebSocket   ┌─────────────┐  get_or_open  ┌──────────────────┐
//! │ client      │ ◄──────────► │ SyncServer  │ ────────────► │ DocumentRegistry │
//! │ (per user)  │  bincode     │ (per conn)  │               └────────┬─────────┘
//! └─────────────┘              └──────▲──────┘                        │ mpsc
//!                                     │ broadcast            ┌────────▼─────────┐
//!                                     └───────────────────── │ DocumentSession  │
//!                                                            │ Document         │
//!                                                            │ PresenceTable    │
//!                                                            └────────┬─────────┘
//!                                                                     │ deferred
//!                                                            ┌────────▼─────────┐
//!                                                            │ DocumentStorage  │
//!                                                            └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: the per-document actor and its handle
//! - [`registry`]: routing from document id to session
//! - [`presence`]: active users, cursor colors, idle eviction
//! - [`broadcast`]: fan-out of committed operations and presence changes
//! - [`storage`]: persistence boundary, RocksDB and in-memory backends
//! - [`protocol`]: client/server wire messages
//! - [`server`]: WebSocket transport
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Submit round trip through the actor | <50μs |
//! | Broadcast 1K events × 100 subscribers | <10ms |
//! | Message encode/decode | <500ns |

pub mod broadcast;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, DocumentEvent};
pub use error::SessionError;
pub use presence::{
    Cursor, CursorColor, JoinOutcome, PresenceDelta, PresenceError, PresenceKind,
    PresenceTable, Selection, UserPresence, UserSession, DEFAULT_PALETTE,
};
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
pub use registry::DocumentRegistry;
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{DocumentHandle, JoinAck, SessionConfig, SessionStats};
pub use storage::{
    DocumentMetadata, DocumentStorage, DocumentStore, MemoryStore, PersistenceWriter,
    StoreConfig, StoreError, StoredDocument,
};
