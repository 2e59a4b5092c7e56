//! WebSocket relay transport.
//!
//! The relay is a dumb router: it assigns peer ids, tells room members who
//! comes and goes, and forwards opaque channel payloads. It never looks
//! inside a payload and holds no session state of its own.
//!
//! ```text
//! RelayTransport ──┐   bincode RelayFrame over WebSocket
//! RelayTransport ──┼──► RelayServer ── room (namespace, id) ── peer queues
//! RelayTransport ──┘
//! ```

pub mod client;
pub mod frame;
pub mod server;

pub use client::{RelaySession, RelayTransport};
pub use frame::RelayFrame;
pub use server::{RelayConfig, RelayServer, RelayStats};

/// Relay errors.
#[derive(Debug, Clone)]
pub enum RelayError {
    Io(String),
    WebSocket(String),
    Frame(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::Frame(e) => write!(f, "Frame error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}
