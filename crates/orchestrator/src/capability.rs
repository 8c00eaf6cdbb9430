use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{DispatchError, OrchestratorError, Result};
use crate::request::ExecutionRequest;

/// Well-known capability names referenced by planner output. Nothing stops
/// a deployment from registering others; these are the vocabulary the
/// default unit templates use.
pub mod names {
    pub const PROFILER: &str = "profiler";
    pub const MAPPER: &str = "mapper";
    pub const PLANNER: &str = "planner";
    pub const GENERATOR: &str = "generator";
    pub const TUTOR: &str = "tutor";
    pub const EXPLAINER: &str = "explainer";
}

/// What a capability hands back to the dispatcher.
#[derive(Debug, Clone)]
pub struct CapabilityOutput {
    pub payload: Value,
    /// Durable note for the memory middleware to persist, if the
    /// capability learned something worth keeping.
    pub note: Option<String>,
}

impl CapabilityOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// An isolated subagent capability: profiler, mapper, planner, generator,
/// tutor, explainer. Each invocation sees only its `ExecutionContext`;
/// capabilities never share state with each other or with the session.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Tools this capability is allowed to use. The dispatcher copies the
    /// list into every context built for this capability.
    fn tool_allowlist(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(
        &self,
        request: &ExecutionRequest,
        ctx: &ExecutionContext,
    ) -> std::result::Result<CapabilityOutput, DispatchError>;

    /// Structural check on the output before it is accepted. The default
    /// rejects null payloads.
    fn validate_output(&self, output: &CapabilityOutput) -> std::result::Result<(), DispatchError> {
        if output.payload.is_null() {
            return Err(DispatchError::InvalidOutput(format!(
                "capability {} returned a null payload",
                self.name()
            )));
        }
        Ok(())
    }
}

/// Registry of capabilities available to the dispatcher. Names are unique;
/// collisions are rejected at registration time rather than at dispatch.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(OrchestratorError::CapabilityExists(name));
        }
        self.capabilities.insert(name, capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Registered capability names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoCapability;

    #[async_trait]
    impl Capability for EchoCapability {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            request: &ExecutionRequest,
            _ctx: &ExecutionContext,
        ) -> std::result::Result<CapabilityOutput, DispatchError> {
            Ok(CapabilityOutput::new(request.payload.clone()))
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(EchoCapability)).unwrap();

        let err = registry.register(Arc::new(EchoCapability)).unwrap_err();
        assert!(matches!(err, OrchestratorError::CapabilityExists(name) if name == "echo"));
    }

    #[test]
    fn test_lookup() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(EchoCapability)).unwrap();

        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn test_default_output_validation() {
        let capability = EchoCapability;
        assert!(capability
            .validate_output(&CapabilityOutput::new(json!({"ok": true})))
            .is_ok());
        assert!(capability
            .validate_output(&CapabilityOutput::new(Value::Null))
            .is_err());
    }
}
