//! # tablesync-collab: peer-to-peer session sync for tablesync
//!
//! Keeps every peer's `SessionDocument` converged with a host-authoritative
//! model: the host sends full syncs to joiners, all peers broadcast
//! incremental edits, and the host publishes a periodic state digest so
//! followers can notice divergence.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐   named channels   ┌───────────────────┐
//! │ SessionController │ ◄────────────────► │ SessionController │
//! │ (host)            │   PeerTransport    │ (follower)        │
//! └─────────┬─────────┘                    └─────────┬─────────┘
//!           │                                        │
//!           ▼                                        ▼
//! ┌───────────────────┐                    ┌───────────────────┐
//! │ StateStore        │                    │ StateStore        │
//! │ HistoryLog        │                    │ HistoryLog        │
//! └─────────┬─────────┘                    └───────────────────┘
//!           │ debounced
//!           ▼
//! ┌───────────────────┐
//! │ SessionStore      │
//! └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Channel names and JSON payloads
//! - [`transport`]: `PeerTransport` seam plus an in-process network
//! - [`relay`]: WebSocket relay server and its `PeerTransport` client
//! - [`session`]: Room lifecycle, sync, desync detection, local API
//! - [`persistence`]: Saved sessions (in memory, or RocksDB with `rocks`)
//! - [`config`]: Per-peer session settings

pub mod config;
pub mod persistence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::SessionConfig;
pub use persistence::{MemorySessionStore, SessionStore, SessionSummary, StoreError};
#[cfg(feature = "rocks")]
pub use persistence::{RocksSessionStore, StoreConfig};
pub use protocol::{Action, ChannelKind, DigestPayload, FullSync, PingPayload, ProtocolError};
pub use relay::{RelayConfig, RelayError, RelayFrame, RelayServer, RelayStats, RelaySession, RelayTransport};
pub use session::{ConnectionState, PeerRole, SessionController, SessionError, SessionEvent};
pub use transport::{
    MemoryNetwork, MemorySession, PeerTransport, TransportError, TransportEvent, TransportSession,
};
