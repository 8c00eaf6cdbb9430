use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::request::{estimate_tokens, Budget};

/// One loaded note: its text plus when the durable copy was last written.
/// Compaction condenses the oldest entries first, so age travels with the
/// content.
#[derive(Debug, Clone)]
struct MemoryEntry {
    content: String,
    recorded_at: DateTime<Utc>,
}

/// Isolated execution context assembled for a single dispatch.
///
/// The middleware pipeline fills it before the capability runs: the memory
/// stage loads durable notes, the compaction stage condenses them, the gate
/// never touches it. Capabilities read the context but own no references
/// into session state, so nothing leaks across dispatches.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: Uuid,
    pub unit_id: String,
    pub budget: Budget,
    /// Which dispatch round produced this context (1-based).
    pub attempt: u32,
    /// Notes visible to the capability, keyed by note key. BTreeMap keeps
    /// the assembled context deterministic.
    memory: BTreeMap<String, MemoryEntry>,
    /// Tools the capability may use, as declared at registration.
    tool_allowlist: Vec<String>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(session_id: Uuid, unit_id: impl Into<String>, budget: Budget) -> Self {
        Self {
            session_id,
            unit_id: unit_id.into(),
            budget,
            attempt: 1,
            memory: BTreeMap::new(),
            tool_allowlist: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_tool_allowlist(mut self, tools: Vec<String>) -> Self {
        self.tool_allowlist = tools;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn tool_allowlist(&self) -> &[String] {
        &self.tool_allowlist
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn insert_memory(&mut self, key: impl Into<String>, content: impl Into<String>) {
        self.insert_memory_at(key, content, Utc::now());
    }

    pub fn insert_memory_at(
        &mut self,
        key: impl Into<String>,
        content: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) {
        self.memory.insert(
            key.into(),
            MemoryEntry {
                content: content.into(),
                recorded_at,
            },
        );
    }

    pub fn memory(&self, key: &str) -> Option<&str> {
        self.memory.get(key).map(|entry| entry.content.as_str())
    }

    /// When the durable copy behind a note was last written.
    pub fn memory_recorded_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.memory.get(key).map(|entry| entry.recorded_at)
    }

    pub fn memory_keys(&self) -> impl Iterator<Item = &str> {
        self.memory.keys().map(String::as_str)
    }

    /// Replace a note's content in place, used by compaction. The recorded
    /// timestamp survives the rewrite.
    pub fn replace_memory(&mut self, key: &str, content: String) {
        if let Some(entry) = self.memory.get_mut(key) {
            entry.content = content;
        }
    }

    /// Flatten loaded notes into the text block handed to the capability.
    pub fn assembled_memory(&self) -> String {
        let mut out = String::new();
        for (key, entry) in &self.memory {
            out.push_str("## ");
            out.push_str(key);
            out.push('\n');
            out.push_str(&entry.content);
            out.push('\n');
        }
        out
    }

    /// Token estimate of everything that will reach the capability.
    pub fn estimated_tokens(&self, payload: &serde_json::Value) -> usize {
        estimate_tokens(&self.assembled_memory()) + estimate_tokens(&payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            Uuid::new_v4(),
            "u1",
            Budget::new(Duration::from_secs(10), 100),
        )
    }

    #[test]
    fn test_memory_is_deterministic() {
        let mut ctx = context();
        ctx.insert_memory("b", "second");
        ctx.insert_memory("a", "first");

        let assembled = ctx.assembled_memory();
        let a = assembled.find("## a").unwrap();
        let b = assembled.find("## b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_replace_memory_only_touches_existing_keys() {
        let mut ctx = context();
        ctx.insert_memory("a", "original");
        ctx.replace_memory("a", "condensed".to_string());
        ctx.replace_memory("missing", "ignored".to_string());

        assert_eq!(ctx.memory("a"), Some("condensed"));
        assert_eq!(ctx.memory("missing"), None);
    }

    #[test]
    fn test_estimated_tokens_counts_memory_and_payload() {
        let mut ctx = context();
        assert!(ctx.estimated_tokens(&json!({})) > 0);

        let empty = ctx.estimated_tokens(&json!({}));
        ctx.insert_memory("note", "four words of context");
        assert!(ctx.estimated_tokens(&json!({})) > empty);
    }
}
