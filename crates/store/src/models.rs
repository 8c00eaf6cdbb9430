use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use coach_core::{Evaluation, Explanation, LearningRecord, ProgressSnapshot};

use crate::error::StoreError;
use crate::store::DurableNote;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NoteRow {
    pub session_id: String,
    pub note_key: String,
    pub content: String,
    pub updated_at: i64,
}

impl NoteRow {
    pub fn into_domain(self) -> DurableNote {
        DurableNote {
            session_id: Uuid::parse_str(&self.session_id).unwrap_or_default(),
            key: self.note_key,
            content: self.content,
            updated_at: timestamp_to_datetime(self.updated_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRow {
    pub session_id: String,
    pub snapshot: String,
    pub captured_at: i64,
}

impl SnapshotRow {
    pub fn into_domain(self) -> Result<ProgressSnapshot, StoreError> {
        Ok(serde_json::from_str(&self.snapshot)?)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LearningRecordRow {
    pub id: String,
    pub session_id: String,
    pub unit_id: String,
    pub answer: String,
    pub evaluation: String,
    pub explanation: Option<String>,
    pub elapsed_secs: i64,
    pub attempt_number: i64,
    pub hints_used: i64,
    pub created_at: i64,
}

impl LearningRecordRow {
    pub fn into_domain(self) -> Result<LearningRecord, StoreError> {
        let evaluation: Evaluation = serde_json::from_str(&self.evaluation)?;
        let explanation: Option<Explanation> = self
            .explanation
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(LearningRecord {
            id: Uuid::parse_str(&self.id).unwrap_or_default(),
            session_id: Uuid::parse_str(&self.session_id).unwrap_or_default(),
            unit_id: self.unit_id,
            answer: self.answer,
            evaluation,
            explanation,
            elapsed_secs: self.elapsed_secs.max(0) as u64,
            attempt_number: self.attempt_number.max(0) as u32,
            hints_used: self.hints_used.max(0) as u32,
            created_at: timestamp_to_datetime(self.created_at),
        })
    }

    pub fn from_domain(record: &LearningRecord) -> Result<Self, StoreError> {
        Ok(Self {
            id: record.id.to_string(),
            session_id: record.session_id.to_string(),
            unit_id: record.unit_id.clone(),
            answer: record.answer.clone(),
            evaluation: serde_json::to_string(&record.evaluation)?,
            explanation: record
                .explanation
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            elapsed_secs: record.elapsed_secs as i64,
            attempt_number: record.attempt_number as i64,
            hints_used: record.hints_used as i64,
            created_at: datetime_to_timestamp(record.created_at),
        })
    }
}

pub(crate) fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

pub(crate) fn datetime_to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}
