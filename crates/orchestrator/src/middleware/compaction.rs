use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::request::{ExecutionRequest, ExecutionResult};

use super::{Middleware, Next};

/// Minimum words kept at each end of a condensed note.
const MIN_KEEP_WORDS: usize = 12;

const ELISION_MARKER: &str = "[…]";

/// Context-compaction stage.
///
/// When the assembled context exceeds the threshold, notes are condensed
/// one by one, oldest first, by keeping their head and tail and eliding
/// the middle. Condensation stops as soon as the estimate fits. The stored
/// notes are untouched; only the in-context copies shrink.
pub struct CompactionMiddleware {
    threshold_tokens: usize,
}

impl CompactionMiddleware {
    pub fn new(threshold_tokens: usize) -> Self {
        Self { threshold_tokens }
    }
}

#[async_trait]
impl Middleware for CompactionMiddleware {
    fn name(&self) -> &'static str {
        "compaction"
    }

    async fn handle(
        &self,
        request: ExecutionRequest,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<ExecutionResult, DispatchError> {
        let before = ctx.estimated_tokens(&request.payload);
        if before > self.threshold_tokens {
            compact(ctx, &request.payload, self.threshold_tokens);
            let after = ctx.estimated_tokens(&request.payload);
            debug!(
                session_id = %request.session_id,
                unit_id = %request.unit_id,
                before,
                after,
                "Context compacted"
            );
        }

        next.run(request, ctx).await
    }
}

fn compact(ctx: &mut ExecutionContext, payload: &serde_json::Value, threshold: usize) {
    // Oldest notes first; ties broken by key for determinism. Recency is
    // the durable note's last-written timestamp, carried in by the memory
    // stage.
    let mut keys: Vec<(String, DateTime<Utc>)> = ctx
        .memory_keys()
        .map(|key| {
            let recorded_at = ctx.memory_recorded_at(key).unwrap_or_else(Utc::now);
            (key.to_string(), recorded_at)
        })
        .collect();
    keys.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    for (key, _) in keys {
        if ctx.estimated_tokens(payload) <= threshold {
            break;
        }
        if let Some(content) = ctx.memory(&key) {
            if let Some(condensed) = condense(content, MIN_KEEP_WORDS) {
                ctx.replace_memory(&key, condensed);
            }
        }
    }
}

/// Keep the first and last `keep` words, eliding the middle. Returns `None`
/// when the note is already short enough for condensation to be a no-op.
fn condense(content: &str, keep: usize) -> Option<String> {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.len() <= 2 * keep + 1 {
        return None;
    }
    let head = words[..keep].join(" ");
    let tail = words[words.len() - keep..].join(" ");
    Some(format!("{head} {ELISION_MARKER} {tail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Invoker;
    use crate::request::{estimate_tokens, Budget};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use uuid::Uuid;

    struct CapturingInvoker {
        seen: Mutex<String>,
    }

    #[async_trait]
    impl Invoker for CapturingInvoker {
        async fn invoke(
            &self,
            _request: &ExecutionRequest,
            ctx: &mut ExecutionContext,
        ) -> Result<ExecutionResult, DispatchError> {
            *self.seen.lock().unwrap() = ctx.assembled_memory();
            Ok(ExecutionResult::Success {
                payload: json!({}),
                note: None,
            })
        }
    }

    fn long_note(words: usize) -> String {
        (0..words)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_condense_keeps_head_and_tail() {
        let note = long_note(100);
        let condensed = condense(&note, 5).unwrap();

        assert!(condensed.starts_with("word0 word1 word2 word3 word4"));
        assert!(condensed.ends_with("word95 word96 word97 word98 word99"));
        assert!(condensed.contains(ELISION_MARKER));
        assert!(estimate_tokens(&condensed) < estimate_tokens(&note));
    }

    #[test]
    fn test_condense_short_note_is_noop() {
        assert!(condense("just a few words", 12).is_none());
    }

    #[tokio::test]
    async fn test_under_threshold_leaves_context_alone() {
        let session_id = Uuid::new_v4();
        let budget = Budget::new(Duration::from_secs(1), 10_000);
        let request = ExecutionRequest::new(session_id, "u1", "tutor", json!({}), budget);
        let mut ctx = ExecutionContext::new(session_id, "u1", budget);
        ctx.insert_memory("small", "a handful of words");

        let stack: Vec<Arc<dyn Middleware>> = vec![Arc::new(CompactionMiddleware::new(1_000))];
        let invoker = CapturingInvoker {
            seen: Mutex::new(String::new()),
        };
        Next::new(&stack, &invoker)
            .run(request, &mut ctx)
            .await
            .unwrap();

        assert!(invoker.seen.lock().unwrap().contains("a handful of words"));
    }

    #[tokio::test]
    async fn test_over_threshold_condenses_oldest_first() {
        let session_id = Uuid::new_v4();
        let budget = Budget::new(Duration::from_secs(1), 10_000);
        let request = ExecutionRequest::new(session_id, "u1", "tutor", json!({}), budget);
        let mut ctx = ExecutionContext::new(session_id, "u1", budget);

        let now = chrono::Utc::now();
        ctx.insert_memory_at("stale", long_note(500), now - chrono::Duration::hours(2));
        ctx.insert_memory_at(
            "fresh",
            (0..60).map(|i| format!("fresh{i}")).collect::<Vec<_>>().join(" "),
            now,
        );

        let stack: Vec<Arc<dyn Middleware>> = vec![Arc::new(CompactionMiddleware::new(120))];
        let invoker = CapturingInvoker {
            seen: Mutex::new(String::new()),
        };
        Next::new(&stack, &invoker)
            .run(request, &mut ctx)
            .await
            .unwrap();

        let seen = invoker.seen.lock().unwrap();
        // The stale note was elided; the fresh one came through whole.
        assert!(seen.contains(ELISION_MARKER));
        for i in 0..60 {
            assert!(seen.contains(&format!("fresh{i}")));
        }
        assert!(estimate_tokens(&seen) < 500);
    }
}
