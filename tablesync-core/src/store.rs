//! State store: exclusive owner of the local session document.
//!
//! Every mutation goes through [`StateStore::update`] (or a helper built on
//! it) so the revision counter and `updated_at` stay in step. Full-sync
//! replacement goes through [`StateStore::replace`], which swaps in a
//! document that was fully constructed beforehand.

use crate::digest::StateDigest;
use crate::document::{ChatMessage, DiceRoll, SessionDocument};

/// Caps for the append-only logs inside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLimits {
    pub dice: usize,
    pub chat: usize,
}

impl Default for LogLimits {
    fn default() -> Self {
        Self {
            dice: 100,
            chat: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    document: SessionDocument,
    /// Bumped on every local or remote mutation and every replacement
    revision: u64,
    limits: LogLimits,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(SessionDocument::default())
    }
}

impl StateStore {
    pub fn new(document: SessionDocument) -> Self {
        Self::with_limits(document, LogLimits::default())
    }

    pub fn with_limits(document: SessionDocument, limits: LogLimits) -> Self {
        Self {
            document,
            revision: 0,
            limits,
        }
    }

    pub fn document(&self) -> &SessionDocument {
        &self.document
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Apply `f` to the document atomically with respect to other handlers.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut SessionDocument) -> R) -> R {
        let result = f(&mut self.document);
        self.document.touch();
        self.revision += 1;
        result
    }

    /// Swap in a whole document, returning the previous one.
    pub fn replace(&mut self, document: SessionDocument) -> SessionDocument {
        self.revision += 1;
        std::mem::replace(&mut self.document, document)
    }

    /// Owned copy of the current document.
    pub fn snapshot(&self) -> SessionDocument {
        self.document.clone()
    }

    pub fn digest(&self) -> StateDigest {
        StateDigest::of(&self.document)
    }

    /// Append a dice roll. Returns false for a duplicate id.
    pub fn append_dice_roll(&mut self, roll: DiceRoll) -> bool {
        if self.document.dice_log.iter().any(|r| r.id == roll.id) {
            return false;
        }
        let cap = self.limits.dice;
        self.update(|doc| doc.push_dice_roll(roll, cap))
    }

    /// Append a chat message. Returns false for a duplicate id.
    pub fn append_chat(&mut self, message: ChatMessage) -> bool {
        if self.document.chat_log.iter().any(|m| m.id == message.id) {
            return false;
        }
        let cap = self.limits.chat;
        self.update(|doc| doc.push_chat(message, cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ElementPatch, FogState, Point};

    #[test]
    fn test_update_bumps_revision() {
        let mut store = StateStore::default();
        assert_eq!(store.revision(), 0);
        store.update(|doc| doc.upsert_element(&ElementPatch::position("t1", 1.0, 1.0)));
        assert_eq!(store.revision(), 1);
        assert!(store.document().element("t1").is_some());
    }

    #[test]
    fn test_replace_swaps_whole_document() {
        let mut store = StateStore::default();
        store.update(|doc| doc.upsert_element(&ElementPatch::position("old", 0.0, 0.0)));

        let mut incoming = SessionDocument::new("Host copy");
        incoming.fog = FogState {
            enabled: true,
            revealed: vec![vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(1.0, 1.0)]],
        };
        let previous = store.replace(incoming.clone());

        assert!(previous.element("old").is_some());
        assert_eq!(store.document(), &incoming);
        assert!(store.document().element("old").is_none());
    }

    #[test]
    fn test_duplicate_dice_roll_leaves_revision() {
        let mut store = StateStore::default();
        let roll = DiceRoll { id: "r1".into(), total: 7, ..DiceRoll::default() };
        assert!(store.append_dice_roll(roll.clone()));
        let rev = store.revision();
        assert!(!store.append_dice_roll(roll));
        assert_eq!(store.revision(), rev);
    }

    #[test]
    fn test_chat_respects_limit() {
        let limits = LogLimits { dice: 10, chat: 2 };
        let mut store = StateStore::with_limits(SessionDocument::new("T"), limits);
        for i in 0..4 {
            store.append_chat(ChatMessage { id: format!("m{i}"), ..ChatMessage::default() });
        }
        let ids: Vec<_> = store.document().chat_log.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }
}
