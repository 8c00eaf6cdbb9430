use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use coach_core::{LearningRecord, ProgressSnapshot};

use crate::error::StoreError;
use crate::models::{
    datetime_to_timestamp, LearningRecordRow, NoteRow, SnapshotRow,
};
use crate::store::{DurableNote, DurableStore};

/// SQLite-backed store. All writes go through upserts or appends, so the
/// orchestrator can safely repeat them after a retried dispatch.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn save_note(
        &self,
        session_id: Uuid,
        key: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notes (session_id, note_key, content, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (session_id, note_key)
            DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id.to_string())
        .bind(key)
        .bind(content)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_note(
        &self,
        session_id: Uuid,
        key: &str,
    ) -> Result<Option<DurableNote>, StoreError> {
        let row: Option<NoteRow> = sqlx::query_as(
            r#"
            SELECT session_id, note_key, content, updated_at
            FROM notes
            WHERE session_id = ? AND note_key = ?
            "#,
        )
        .bind(session_id.to_string())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    async fn list_notes(&self, session_id: Uuid) -> Result<Vec<DurableNote>, StoreError> {
        let rows: Vec<NoteRow> = sqlx::query_as(
            r#"
            SELECT session_id, note_key, content, updated_at
            FROM notes
            WHERE session_id = ?
            ORDER BY note_key
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    async fn save_progress(&self, snapshot: &ProgressSnapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_string(snapshot)?;

        sqlx::query(
            r#"
            INSERT INTO progress_snapshots (session_id, snapshot, captured_at)
            VALUES (?, ?, ?)
            ON CONFLICT (session_id)
            DO UPDATE SET snapshot = excluded.snapshot, captured_at = excluded.captured_at
            "#,
        )
        .bind(snapshot.session_id.to_string())
        .bind(payload)
        .bind(datetime_to_timestamp(snapshot.captured_at))
        .execute(&self.pool)
        .await?;

        debug!(
            session_id = %snapshot.session_id,
            status = snapshot.status.as_str(),
            "Progress snapshot saved"
        );
        Ok(())
    }

    async fn load_progress(
        &self,
        session_id: Uuid,
    ) -> Result<Option<ProgressSnapshot>, StoreError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT session_id, snapshot, captured_at
            FROM progress_snapshots
            WHERE session_id = ?
            "#,
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    async fn append_record(&self, record: &LearningRecord) -> Result<(), StoreError> {
        let row = LearningRecordRow::from_domain(record)?;

        sqlx::query(
            r#"
            INSERT INTO learning_records
                (id, session_id, unit_id, answer, evaluation, explanation,
                 elapsed_secs, attempt_number, hints_used, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.session_id)
        .bind(&row.unit_id)
        .bind(&row.answer)
        .bind(&row.evaluation)
        .bind(&row.explanation)
        .bind(row.elapsed_secs)
        .bind(row.attempt_number)
        .bind(row.hints_used)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn records_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<LearningRecord>, StoreError> {
        let rows: Vec<LearningRecordRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, unit_id, answer, evaluation, explanation,
                   elapsed_secs, attempt_number, hints_used, created_at
            FROM learning_records
            WHERE session_id = ?
            ORDER BY created_at, attempt_number
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    async fn records_for_unit(
        &self,
        session_id: Uuid,
        unit_id: &str,
    ) -> Result<Vec<LearningRecord>, StoreError> {
        let rows: Vec<LearningRecordRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, unit_id, answer, evaluation, explanation,
                   elapsed_secs, attempt_number, hints_used, created_at
            FROM learning_records
            WHERE session_id = ? AND unit_id = ?
            ORDER BY attempt_number
            "#,
        )
        .bind(session_id.to_string())
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use coach_core::{Citation, Evaluation, Explanation};

    async fn setup_test_store() -> SqliteStore {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn test_save_note_is_full_replacement() {
        let store = setup_test_store().await;
        let session_id = Uuid::new_v4();

        store.save_note(session_id, "u1", "first").await.unwrap();
        store.save_note(session_id, "u1", "second").await.unwrap();

        let notes = store.list_notes(session_id).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].content, "second");
    }

    #[tokio::test]
    async fn test_notes_are_scoped_by_session() {
        let store = setup_test_store().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.save_note(a, "u1", "session a").await.unwrap();
        store.save_note(b, "u1", "session b").await.unwrap();

        let note = store.load_note(a, "u1").await.unwrap().unwrap();
        assert_eq!(note.content, "session a");
        assert!(store.load_note(a, "u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_progress_snapshot_roundtrip() {
        let store = setup_test_store().await;
        let session_id = Uuid::new_v4();

        let mut snapshot = ProgressSnapshot {
            session_id,
            project_id: Uuid::new_v4(),
            status: coach_core::SessionStatus::Active,
            mode: coach_core::LearningMode::Macro,
            current_stage: coach_core::UnitStage::Module,
            completed: ["a".to_string()].into(),
            skipped: Default::default(),
            failed: Default::default(),
            summary: None,
            captured_at: Utc::now(),
        };
        store.save_progress(&snapshot).await.unwrap();

        snapshot.completed.insert("b".to_string());
        store.save_progress(&snapshot).await.unwrap();

        let loaded = store.load_progress(session_id).await.unwrap().unwrap();
        assert_eq!(loaded.completed.len(), 2);
        assert_eq!(loaded.status, coach_core::SessionStatus::Active);

        assert!(store.load_progress(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_are_append_only() {
        let store = setup_test_store().await;
        let session_id = Uuid::new_v4();

        let first = LearningRecord::new(
            session_id,
            "q1",
            "an answer",
            Evaluation {
                score: 40.0,
                ..Default::default()
            },
        );
        let retry = LearningRecord::new(
            session_id,
            "q1",
            "a better answer",
            Evaluation {
                score: 80.0,
                ..Default::default()
            },
        )
        .with_attempt_number(2)
        .with_explanation(Explanation {
            summary: "look at the dispatch loop".to_string(),
            citations: vec![Citation::new("src/dispatch.rs", 1, 20)],
            addressed_points: vec![],
        });

        store.append_record(&first).await.unwrap();
        store.append_record(&retry).await.unwrap();

        let records = store.records_for_unit(session_id, "q1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attempt_number, 1);
        assert_eq!(records[1].attempt_number, 2);
        assert!(records[1].is_correct());
        assert_eq!(
            records[1].explanation.as_ref().unwrap().citations.len(),
            1
        );

        let all = store.records_for_session(session_id).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
