use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use coach_core::{LearningRecord, ProgressSnapshot};

use crate::error::StoreError;

/// One durable note as stored, including its last write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableNote {
    pub session_id: Uuid,
    pub key: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// Storage boundary for everything the orchestrator persists.
///
/// Notes are keyed by (session, key) and saving is a full replacement, so
/// repeating a write with the same content is idempotent. Progress
/// snapshots are one-per-session. Learning records are append-only.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn save_note(
        &self,
        session_id: Uuid,
        key: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn load_note(&self, session_id: Uuid, key: &str)
        -> Result<Option<DurableNote>, StoreError>;

    /// All notes for a session, ordered by key.
    async fn list_notes(&self, session_id: Uuid) -> Result<Vec<DurableNote>, StoreError>;

    async fn save_progress(&self, snapshot: &ProgressSnapshot) -> Result<(), StoreError>;

    async fn load_progress(
        &self,
        session_id: Uuid,
    ) -> Result<Option<ProgressSnapshot>, StoreError>;

    async fn append_record(&self, record: &LearningRecord) -> Result<(), StoreError>;

    /// Records for a session in insertion order.
    async fn records_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<LearningRecord>, StoreError>;

    async fn records_for_unit(
        &self,
        session_id: Uuid,
        unit_id: &str,
    ) -> Result<Vec<LearningRecord>, StoreError>;
}
