use crate::job::JobId;
use crate::workflow::WorkflowId;

/// Key layout shared by the key/value style backends.
///
/// `workflow::{id}`, `job::{id}`, `workflow::payload::{id}` and
/// `workflow::lock::{id}`, each optionally namespaced by a prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn workflow(&self, id: WorkflowId) -> String {
        format!("{}workflow::{}", self.prefix, id)
    }

    pub fn job(&self, id: JobId) -> String {
        format!("{}job::{}", self.prefix, id)
    }

    pub fn payload(&self, id: WorkflowId) -> String {
        format!("{}workflow::payload::{}", self.prefix, id)
    }

    pub fn lock(&self, id: WorkflowId) -> String {
        format!("{}workflow::lock::{}", self.prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = Keyspace::default();
        let id = WorkflowId::new();
        assert_eq!(keys.workflow(id), format!("workflow::{id}"));
        assert_eq!(keys.payload(id), format!("workflow::payload::{id}"));
        assert_eq!(keys.lock(id), format!("workflow::lock::{id}"));
    }

    #[test]
    fn test_prefixed_layout() {
        let keys = Keyspace::new("staging:");
        let job = JobId::new();
        assert_eq!(keys.job(job), format!("staging:job::{job}"));
    }
}
