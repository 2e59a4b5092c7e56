//! Channel wire contract.
//!
//! Every message travels on a named channel and carries a JSON payload whose
//! shape is fixed by that channel:
//!
//! ```text
//! channel     payload                      direction
//! ─────────── ──────────────────────────── ─────────────────
//! sync        SessionDocument + syncSeq    host → one peer
//! reqSync     null                         follower → host
//! elUpdate    ElementPatch                 any → all
//! elDelete    element id (string)          any → all
//! fogUpdate   FogState                     any → all
//! combat      CombatState | null           any → all
//! grid        GridSettings                 any → all
//! diceRoll    DiceRoll                     any → all
//! chat        ChatMessage                  any → all
//! cursor      Point                        any → all (transient)
//! ping        Point + color                any → all (transient)
//! plyJoin     Player                       any → all
//! plyLeave    peer id (string)             any → all
//! digest      DigestPayload                host → all
//! ```
//!
//! Names are limited to [`MAX_CHANNEL_NAME_BYTES`](crate::transport::MAX_CHANNEL_NAME_BYTES) by the transport and must
//! not change; peers from other implementations match on them verbatim.

use serde::{Deserialize, Serialize};
use tablesync_core::{
    ChatMessage, CombatState, DiceRoll, ElementId, ElementPatch, FogState, GridSettings, PeerId,
    Player, Point, SessionDocument, StateDigest,
};

/// Logical message categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Sync,
    ElementUpdate,
    ElementDelete,
    Cursor,
    Ping,
    PlayerJoin,
    PlayerLeave,
    RequestSync,
    FogUpdate,
    DiceRoll,
    Combat,
    Chat,
    Digest,
    Grid,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 14] = [
        Self::Sync,
        Self::ElementUpdate,
        Self::ElementDelete,
        Self::Cursor,
        Self::Ping,
        Self::PlayerJoin,
        Self::PlayerLeave,
        Self::RequestSync,
        Self::FogUpdate,
        Self::DiceRoll,
        Self::Combat,
        Self::Chat,
        Self::Digest,
        Self::Grid,
    ];

    /// Wire identifier.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::ElementUpdate => "elUpdate",
            Self::ElementDelete => "elDelete",
            Self::Cursor => "cursor",
            Self::Ping => "ping",
            Self::PlayerJoin => "plyJoin",
            Self::PlayerLeave => "plyLeave",
            Self::RequestSync => "reqSync",
            Self::FogUpdate => "fogUpdate",
            Self::DiceRoll => "diceRoll",
            Self::Combat => "combat",
            Self::Chat => "chat",
            Self::Digest => "digest",
            Self::Grid => "grid",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Cursor and ping never touch the document.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Cursor | Self::Ping)
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `sync` payload: the whole document, plus the host's send sequence.
///
/// The sequence is flattened next to the document fields so a peer that
/// does not know about it still reads a plain document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSync {
    #[serde(flatten)]
    pub document: SessionDocument,
    /// Zero means the sender does not sequence its syncs
    #[serde(default)]
    pub sync_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub x: f64,
    pub y: f64,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestPayload {
    pub digest: StateDigest,
    /// Sequence of the last full sync the host sent
    pub sync_seq: u64,
    pub sent_at: u64,
}

/// A decoded message, one variant per channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Sync(Box<FullSync>),
    ElementUpdate(ElementPatch),
    ElementDelete(ElementId),
    Cursor(Point),
    Ping(PingPayload),
    PlayerJoin(Player),
    PlayerLeave(PeerId),
    RequestSync,
    FogUpdate(FogState),
    DiceRoll(DiceRoll),
    Combat(Option<CombatState>),
    Chat(ChatMessage),
    Digest(DigestPayload),
    Grid(GridSettings),
}

impl Action {
    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::Sync(_) => ChannelKind::Sync,
            Self::ElementUpdate(_) => ChannelKind::ElementUpdate,
            Self::ElementDelete(_) => ChannelKind::ElementDelete,
            Self::Cursor(_) => ChannelKind::Cursor,
            Self::Ping(_) => ChannelKind::Ping,
            Self::PlayerJoin(_) => ChannelKind::PlayerJoin,
            Self::PlayerLeave(_) => ChannelKind::PlayerLeave,
            Self::RequestSync => ChannelKind::RequestSync,
            Self::FogUpdate(_) => ChannelKind::FogUpdate,
            Self::DiceRoll(_) => ChannelKind::DiceRoll,
            Self::Combat(_) => ChannelKind::Combat,
            Self::Chat(_) => ChannelKind::Chat,
            Self::Digest(_) => ChannelKind::Digest,
            Self::Grid(_) => ChannelKind::Grid,
        }
    }

    /// Serialize the payload (not the channel name) to JSON.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let result = match self {
            Self::Sync(sync) => serde_json::to_vec(sync),
            Self::ElementUpdate(patch) => serde_json::to_vec(patch),
            Self::ElementDelete(id) => serde_json::to_vec(id),
            Self::Cursor(point) => serde_json::to_vec(point),
            Self::Ping(ping) => serde_json::to_vec(ping),
            Self::PlayerJoin(player) => serde_json::to_vec(player),
            Self::PlayerLeave(peer) => serde_json::to_vec(peer),
            Self::RequestSync => serde_json::to_vec(&()),
            Self::FogUpdate(fog) => serde_json::to_vec(fog),
            Self::DiceRoll(roll) => serde_json::to_vec(roll),
            Self::Combat(combat) => serde_json::to_vec(combat),
            Self::Chat(message) => serde_json::to_vec(message),
            Self::Digest(digest) => serde_json::to_vec(digest),
            Self::Grid(grid) => serde_json::to_vec(grid),
        };
        result.map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Decode a payload received on `channel`.
    pub fn decode(channel: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        let kind = ChannelKind::from_name(channel)
            .ok_or_else(|| ProtocolError::UnknownChannel(channel.to_string()))?;
        let map_err = |e: serde_json::Error| ProtocolError::DeserializationError {
            channel: kind,
            reason: e.to_string(),
        };
        let action = match kind {
            ChannelKind::Sync => Self::Sync(Box::new(serde_json::from_slice(payload).map_err(map_err)?)),
            ChannelKind::ElementUpdate => Self::ElementUpdate(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::ElementDelete => Self::ElementDelete(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::Cursor => Self::Cursor(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::Ping => Self::Ping(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::PlayerJoin => Self::PlayerJoin(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::PlayerLeave => Self::PlayerLeave(serde_json::from_slice(payload).map_err(map_err)?),
            // Payload is null or empty; content is irrelevant
            ChannelKind::RequestSync => Self::RequestSync,
            ChannelKind::FogUpdate => Self::FogUpdate(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::DiceRoll => Self::DiceRoll(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::Combat => Self::Combat(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::Chat => Self::Chat(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::Digest => Self::Digest(serde_json::from_slice(payload).map_err(map_err)?),
            ChannelKind::Grid => Self::Grid(serde_json::from_slice(payload).map_err(map_err)?),
        };
        Ok(action)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    UnknownChannel(String),
    SerializationError(String),
    DeserializationError { channel: ChannelKind, reason: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChannel(name) => write!(f, "Unknown channel: {name}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError { channel, reason } => {
                write!(f, "Malformed {channel} payload: {reason}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
