//! # tablesync-core: shared session model for tablesync
//!
//! Pure, synchronous building blocks. Nothing here touches the network.
//!
//! ## Modules
//!
//! - [`document`]: Session document, canvas elements, fog, combat, logs
//! - [`store`]: `StateStore`, the exclusive owner of one peer's document
//! - [`digest`]: SHA-256 state digest used for desync detection
//! - [`history`]: Local undo/redo log with before/after fragments

pub mod document;
pub mod store;
pub mod digest;
pub mod history;

pub use document::{
    now_millis, CanvasElement, ChatMessage, CombatState, Combatant, DiceRoll, ElementId,
    ElementKind, ElementPatch, FogState, GridSettings, PeerId, Player, Point, Polygon, Role,
    SessionDocument, Upsert, Visibility,
};
pub use store::{LogLimits, StateStore};
pub use digest::StateDigest;
pub use history::{ActionKind, Fragment, HistoryAction, HistoryLog, Origin, Target, DEFAULT_DEPTH};
