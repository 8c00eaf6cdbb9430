use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use coach_core::{LearningRecord, ProgressSnapshot};

use crate::error::StoreError;
use crate::store::{DurableNote, DurableStore};

/// In-memory store used by tests and ad-hoc sessions that do not need a
/// database. Mirrors the SQLite semantics: notes replace, snapshots
/// replace, records append.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    notes: HashMap<(Uuid, String), DurableNote>,
    snapshots: HashMap<Uuid, ProgressSnapshot>,
    records: Vec<LearningRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_count(&self) -> usize {
        self.inner.lock().unwrap().notes.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn save_note(
        &self,
        session_id: Uuid,
        key: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.notes.insert(
            (session_id, key.to_string()),
            DurableNote {
                session_id,
                key: key.to_string(),
                content: content.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load_note(
        &self,
        session_id: Uuid,
        key: &str,
    ) -> Result<Option<DurableNote>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.notes.get(&(session_id, key.to_string())).cloned())
    }

    async fn list_notes(&self, session_id: Uuid) -> Result<Vec<DurableNote>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut notes: Vec<DurableNote> = inner
            .notes
            .values()
            .filter(|n| n.session_id == session_id)
            .cloned()
            .collect();
        notes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(notes)
    }

    async fn save_progress(&self, snapshot: &ProgressSnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshots.insert(snapshot.session_id, snapshot.clone());
        Ok(())
    }

    async fn load_progress(
        &self,
        session_id: Uuid,
    ) -> Result<Option<ProgressSnapshot>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.snapshots.get(&session_id).cloned())
    }

    async fn append_record(&self, record: &LearningRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.push(record.clone());
        Ok(())
    }

    async fn records_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<LearningRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn records_for_unit(
        &self,
        session_id: Uuid,
        unit_id: &str,
    ) -> Result<Vec<LearningRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.session_id == session_id && r.unit_id == unit_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coach_core::Evaluation;

    #[tokio::test]
    async fn test_note_replacement() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();

        store.save_note(session_id, "u1", "first").await.unwrap();
        store.save_note(session_id, "u1", "second").await.unwrap();

        assert_eq!(store.note_count(), 1);
        let note = store.load_note(session_id, "u1").await.unwrap().unwrap();
        assert_eq!(note.content, "second");
    }

    #[tokio::test]
    async fn test_records_append() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();

        let record = LearningRecord::new(session_id, "q1", "answer", Evaluation::default());
        store.append_record(&record).await.unwrap();
        store
            .append_record(&record.clone().with_attempt_number(2))
            .await
            .unwrap();

        let records = store.records_for_unit(session_id, "q1").await.unwrap();
        assert_eq!(records.len(), 2);
    }
}
