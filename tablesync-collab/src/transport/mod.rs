//! Peer transport adapter contract.
//!
//! The session controller only talks to the network through these two
//! traits. A transport opens one session per room membership; the session
//! assigns the local peer id, delivers roster changes and messages on a
//! single event queue, and sends named-channel payloads to all peers or a
//! target subset.
//!
//! Delivery is per-sender FIFO on each channel. Nothing is acknowledged.

use std::future::Future;
use tablesync_core::PeerId;
use tokio::sync::mpsc;

pub mod memory;

pub use memory::{MemoryNetwork, MemorySession};

/// Longest channel name a transport accepts.
pub const MAX_CHANNEL_NAME_BYTES: usize = 12;

/// Events delivered by an open transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Fired once when a remote peer becomes reachable
    PeerJoined(PeerId),
    /// Fired once when a remote peer goes away
    PeerLeft(PeerId),
    Message {
        channel: String,
        payload: Vec<u8>,
        from: PeerId,
    },
    /// The session ended underneath us
    Closed(Option<String>),
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Room could not be created or joined
    OpenFailed(String),
    NotConnected,
    SendFailed(String),
    InvalidChannel(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenFailed(e) => write!(f, "Failed to open room: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::SendFailed(e) => write!(f, "Send failed: {e}"),
            Self::InvalidChannel(name) => write!(f, "Invalid channel name: {name}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Reject empty or oversized channel names.
pub fn validate_channel(name: &str) -> Result<(), TransportError> {
    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_BYTES {
        return Err(TransportError::InvalidChannel(name.to_string()));
    }
    Ok(())
}

/// One room membership.
pub trait TransportSession: Send {
    /// Identity assigned to us for this membership.
    fn local_peer_id(&self) -> &str;

    /// Send `payload` on `channel`. `None` targets broadcasts to every
    /// connected peer except ourselves.
    fn send(
        &self,
        channel: &str,
        payload: Vec<u8>,
        targets: Option<&[PeerId]>,
    ) -> Result<(), TransportError>;

    /// Take the event queue. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Leave the room. Calling it twice is harmless.
    fn leave(&mut self);
}

/// Factory for room sessions.
pub trait PeerTransport {
    type Session: TransportSession + 'static;

    fn open(
        &self,
        app_namespace: &str,
        room_id: &str,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}
