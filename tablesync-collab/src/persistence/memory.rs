use std::collections::HashMap;
use std::sync::Mutex;
use tablesync_core::SessionDocument;
use uuid::Uuid;

use super::{most_recent, SessionStore, SessionSummary, StoreError};

/// Saved sessions held in memory.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Uuid, (SessionDocument, SessionSummary)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::DatabaseError("session store lock poisoned".into())
}

impl SessionStore for MemorySessionStore {
    fn save(&self, document: &SessionDocument, is_host: bool) -> Result<SessionSummary, StoreError> {
        let summary = SessionSummary::of(document, is_host);
        self.sessions
            .lock()
            .map_err(|_| poisoned())?
            .insert(document.id, (document.clone(), summary.clone()));
        Ok(summary)
    }

    fn load(&self, id: Uuid) -> Result<SessionDocument, StoreError> {
        self.sessions
            .lock()
            .map_err(|_| poisoned())?
            .get(&id)
            .map(|(doc, _)| doc.clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        let sessions = self.sessions.lock().map_err(|_| poisoned())?;
        let summaries = sessions.values().map(|(_, s)| s.clone()).collect();
        Ok(most_recent(summaries, limit))
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.sessions.lock().map_err(|_| poisoned())?.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_core::ElementPatch;

    #[test]
    fn test_save_load() {
        let store = MemorySessionStore::new();
        let mut doc = SessionDocument::new("Crypt");
        doc.upsert_element(&ElementPatch::position("t1", 1.0, 1.0));

        let summary = store.save(&doc, true).unwrap();
        assert_eq!(summary.element_count, 1);
        assert!(summary.is_host);
        assert_eq!(store.load(doc.id).unwrap(), doc);
    }

    #[test]
    fn test_load_missing() {
        let store = MemorySessionStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(store.load(id), Err(StoreError::NotFound(missing)) if missing == id));
    }

    #[test]
    fn test_list_recent_orders_and_limits() {
        let store = MemorySessionStore::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let mut doc = SessionDocument::new(*name);
            doc.updated_at = 1_000 + i as u64;
            store.save(&doc, false).unwrap();
        }
        let recent = store.list_recent(2).unwrap();
        let names: Vec<_> = recent.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = MemorySessionStore::new();
        let doc = SessionDocument::new("x");
        store.save(&doc, false).unwrap();
        store.delete(doc.id).unwrap();
        store.delete(doc.id).unwrap();
        assert!(store.is_empty());
    }
}
