use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::{HandlerError, JobContext};
use crate::error::{FlowError, Result};

/// User job logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. Return [`HandlerError::Aborted`] (usually via
    /// [`JobContext::abort`]) to fail the job terminally without retries.
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Maps job type names to their handlers.
///
/// Populated once at startup and shared by every adapter.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("job_types", &types).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) -> &mut Self {
        self.register_arc(job_type, Arc::new(handler))
    }

    /// Register a handler shared with other job types or registries.
    pub fn register_arc(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn with(mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.register(job_type, handler);
        self
    }

    pub fn resolve(&self, job_type: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(job_type)
            .cloned()
            .ok_or_else(|| FlowError::UnknownJobType(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn perform(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_registered_type() {
        let registry = HandlerRegistry::new().with("noop", Noop);
        assert!(registry.contains("noop"));
        assert!(registry.resolve("noop").is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shared_handler_serves_several_types() {
        let shared: Arc<dyn JobHandler> = Arc::new(Noop);
        let mut registry = HandlerRegistry::new();
        registry.register_arc("a", shared.clone()).register_arc("b", shared.clone());
        assert!(Arc::ptr_eq(&registry.resolve("a").unwrap(), &registry.resolve("b").unwrap()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("ghost").err().unwrap();
        assert!(matches!(err, FlowError::UnknownJobType(ref t) if t == "ghost"));
    }
}
