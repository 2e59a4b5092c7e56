//! Compact state digest for desync detection.
//!
//! SHA-256 over the canonical JSON of the document, hex encoded. The
//! `updated_at` timestamp is left out: it is local bookkeeping and differs
//! between peers holding identical content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::document::{
    CanvasElement, ChatMessage, CombatState, DiceRoll, FogState, GridSettings, PeerId, Player,
    SessionDocument,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDigest(String);

/// Borrowed view of the fields that take part in the digest.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DigestView<'a> {
    id: &'a Uuid,
    name: &'a str,
    created_at: u64,
    grid: &'a GridSettings,
    elements: &'a [CanvasElement],
    fog: &'a FogState,
    players: &'a BTreeMap<PeerId, Player>,
    combat: &'a Option<CombatState>,
    dice_log: &'a [DiceRoll],
    chat_log: &'a [ChatMessage],
}

impl StateDigest {
    pub fn of(document: &SessionDocument) -> Self {
        let view = DigestView {
            id: &document.id,
            name: &document.name,
            created_at: document.created_at,
            grid: &document.grid,
            elements: &document.elements,
            fog: &document.fog,
            players: &document.players,
            combat: &document.combat,
            dice_log: &document.dice_log,
            chat_log: &document.chat_log,
        };
        match serde_json::to_vec(&view) {
            Ok(bytes) => Self(format!("{:x}", Sha256::digest(&bytes))),
            Err(e) => {
                log::warn!("Failed to serialize document for digest: {e}");
                Self(String::new())
            }
        }
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty digest never matches anything, including itself.
    pub fn matches(&self, other: &StateDigest) -> bool {
        !self.0.is_empty() && self.0 == other.0
    }
}

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
