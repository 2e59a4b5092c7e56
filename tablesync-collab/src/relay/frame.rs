//! Relay wire frames (bincode, serde mode).
//!
//! ```text
//! client → relay   Hello, Send
//! relay → client   Welcome, Rejected, Deliver, PeerJoined, PeerLeft
//! ```

use serde::{Deserialize, Serialize};
use tablesync_core::PeerId;

use super::RelayError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// First frame a client sends
    Hello { namespace: String, room: String },
    /// Admission, with the id assigned to the client and the current members
    Welcome { peer_id: PeerId, peers: Vec<PeerId> },
    Rejected { reason: String },
    /// `targets: None` broadcasts to the rest of the room
    Send {
        channel: String,
        targets: Option<Vec<PeerId>>,
        payload: Vec<u8>,
    },
    Deliver {
        from: PeerId,
        channel: String,
        payload: Vec<u8>,
    },
    PeerJoined(PeerId),
    PeerLeft(PeerId),
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::Frame(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RelayError::Frame(e.to_string()))?;
        Ok(frame)
    }
}
