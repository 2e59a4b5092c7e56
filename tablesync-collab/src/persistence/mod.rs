//! Local persistence of saved sessions.
//!
//! The controller only needs four operations, so the collaborator is a small
//! synchronous trait. Saves are debounced by the controller; stores do not
//! buffer on their own.
//!
//! - [`MemorySessionStore`]: process-lifetime store, used in tests
//! - `RocksSessionStore`: RocksDB-backed store (feature `rocks`)

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tablesync_core::SessionDocument;
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "rocks")]
pub mod rocks;

pub use memory::MemorySessionStore;
#[cfg(feature = "rocks")]
pub use rocks::{RocksSessionStore, StoreConfig};

/// Listing entry for a saved session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub name: String,
    /// Whether the local peer was host when it last saved
    pub is_host: bool,
    pub updated_at: u64,
    pub element_count: usize,
    pub player_count: usize,
}

impl SessionSummary {
    pub fn of(document: &SessionDocument, is_host: bool) -> Self {
        Self {
            id: document.id,
            name: document.name.clone(),
            is_host,
            updated_at: document.updated_at,
            element_count: document.elements.len(),
            player_count: document.players.len(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// Session not found
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Session not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait SessionStore: Send + Sync {
    fn save(&self, document: &SessionDocument, is_host: bool) -> Result<SessionSummary, StoreError>;

    fn load(&self, id: Uuid) -> Result<SessionDocument, StoreError>;

    /// Most recently updated first.
    fn list_recent(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError>;

    /// Deleting an unknown id is not an error.
    fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    fn save(&self, document: &SessionDocument, is_host: bool) -> Result<SessionSummary, StoreError> {
        (**self).save(document, is_host)
    }

    fn load(&self, id: Uuid) -> Result<SessionDocument, StoreError> {
        (**self).load(id)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        (**self).list_recent(limit)
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        (**self).delete(id)
    }
}

/// Sort newest first and cut to `limit`.
pub(crate) fn most_recent(mut summaries: Vec<SessionSummary>, limit: usize) -> Vec<SessionSummary> {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    summaries.truncate(limit);
    summaries
}
