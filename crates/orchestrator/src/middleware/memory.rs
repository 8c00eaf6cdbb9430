use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use store::DurableStore;

use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::request::{ExecutionRequest, ExecutionResult};

use super::{Middleware, Next};

/// Durable-memory stage.
///
/// Before the capability runs, every note stored for the session is loaded
/// into the execution context. After a successful run, the note the
/// capability emitted is written back under the unit's key. Writes replace
/// the whole note, so re-dispatching a unit leaves exactly one note behind.
pub struct MemoryMiddleware {
    store: Arc<dyn DurableStore>,
}

impl MemoryMiddleware {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Middleware for MemoryMiddleware {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn handle(
        &self,
        request: ExecutionRequest,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<ExecutionResult, DispatchError> {
        let session_id = request.session_id;
        let unit_id = request.unit_id.clone();

        let notes = self
            .store
            .list_notes(session_id)
            .await
            .map_err(|e| DispatchError::Store(e.to_string()))?;
        let loaded = notes.len();
        for note in notes {
            ctx.insert_memory_at(note.key, note.content, note.updated_at);
        }
        debug!(
            session_id = %session_id,
            unit_id = %unit_id,
            notes = loaded,
            "Durable notes loaded into context"
        );

        let result = next.run(request, ctx).await?;

        if let ExecutionResult::Success {
            note: Some(content),
            ..
        } = &result
        {
            self.store
                .save_note(session_id, &unit_id, content)
                .await
                .map_err(|e| DispatchError::Store(e.to_string()))?;
            debug!(
                session_id = %session_id,
                unit_id = %unit_id,
                "Durable note persisted"
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Invoker;
    use crate::request::Budget;
    use serde_json::json;
    use std::time::Duration;
    use store::MemoryStore;
    use uuid::Uuid;

    struct NoteEmittingInvoker {
        note: Option<String>,
        saw_memory: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Invoker for NoteEmittingInvoker {
        async fn invoke(
            &self,
            _request: &ExecutionRequest,
            ctx: &mut ExecutionContext,
        ) -> Result<ExecutionResult, DispatchError> {
            let keys: Vec<String> = ctx.memory_keys().map(str::to_string).collect();
            *self.saw_memory.lock().unwrap() = keys;
            Ok(ExecutionResult::Success {
                payload: json!({}),
                note: self.note.clone(),
            })
        }
    }

    fn setup(
        session_id: Uuid,
        unit_id: &str,
    ) -> (ExecutionRequest, ExecutionContext) {
        let budget = Budget::new(Duration::from_secs(1), 1000);
        (
            ExecutionRequest::new(session_id, unit_id, "tutor", json!({}), budget),
            ExecutionContext::new(session_id, unit_id, budget),
        )
    }

    #[tokio::test]
    async fn test_notes_load_before_and_persist_after() {
        let store = Arc::new(MemoryStore::new());
        let session_id = Uuid::new_v4();
        store
            .save_note(session_id, "earlier-unit", "prior learning")
            .await
            .unwrap();

        let invoker = NoteEmittingInvoker {
            note: Some("fresh note".to_string()),
            saw_memory: std::sync::Mutex::new(Vec::new()),
        };
        let stack: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(MemoryMiddleware::new(store.clone()))];

        let (request, mut ctx) = setup(session_id, "u1");
        Next::new(&stack, &invoker)
            .run(request, &mut ctx)
            .await
            .unwrap();

        // The capability saw the earlier note.
        assert_eq!(*invoker.saw_memory.lock().unwrap(), vec!["earlier-unit"]);

        // And its own note was persisted under the unit key.
        let note = store.load_note(session_id, "u1").await.unwrap().unwrap();
        assert_eq!(note.content, "fresh note");
    }

    #[tokio::test]
    async fn test_re_dispatch_leaves_one_note() {
        let store = Arc::new(MemoryStore::new());
        let session_id = Uuid::new_v4();
        let invoker = NoteEmittingInvoker {
            note: Some("same note".to_string()),
            saw_memory: std::sync::Mutex::new(Vec::new()),
        };
        let stack: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(MemoryMiddleware::new(store.clone()))];

        for _ in 0..2 {
            let (request, mut ctx) = setup(session_id, "u1");
            Next::new(&stack, &invoker)
                .run(request, &mut ctx)
                .await
                .unwrap();
        }

        assert_eq!(store.note_count(), 1);
    }

    #[tokio::test]
    async fn test_no_note_means_no_write() {
        let store = Arc::new(MemoryStore::new());
        let session_id = Uuid::new_v4();
        let invoker = NoteEmittingInvoker {
            note: None,
            saw_memory: std::sync::Mutex::new(Vec::new()),
        };
        let stack: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(MemoryMiddleware::new(store.clone()))];

        let (request, mut ctx) = setup(session_id, "u1");
        Next::new(&stack, &invoker)
            .run(request, &mut ctx)
            .await
            .unwrap();

        assert_eq!(store.note_count(), 0);
    }
}
