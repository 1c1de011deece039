use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::scheduler::job::{JobKind, JobPayload};

/// Failure reported by an execution backend. Always converted into an
/// attempt failure; never surfaced to the submitter directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl BackendError {
    pub fn failed(message: impl Into<String>) -> Self {
        BackendError::Failed(message.into())
    }
}

/// Capability that performs the actual work for one or more job kinds.
///
/// Implementations must be safe to call concurrently for different jobs and
/// must not assume any state shared between calls.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name used in log fields
    fn name(&self) -> &str;

    /// Synchronous payload check run at submit time. A rejected payload
    /// never becomes a job.
    fn validate(&self, _kind: &JobKind, _payload: &JobPayload) -> Result<(), BackendError> {
        Ok(())
    }

    /// Perform the work and return an opaque reference to the produced output.
    async fn execute(&self, kind: &JobKind, payload: &JobPayload) -> Result<String, BackendError>;
}

/// Maps each job kind to the backend that handles it.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<JobKind, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.insert(kind, backend);
        self
    }

    pub fn insert(&mut self, kind: JobKind, backend: Arc<dyn ExecutionBackend>) {
        tracing::debug!(kind = %kind, backend = backend.name(), "Execution backend registered");
        self.backends.insert(kind, backend);
    }

    pub fn get(&self, kind: &JobKind) -> Option<Arc<dyn ExecutionBackend>> {
        self.backends.get(kind).cloned()
    }

    pub fn contains(&self, kind: &JobKind) -> bool {
        self.backends.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.backends.keys().cloned().collect()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .backends
            .iter()
            .map(|(kind, backend)| format!("{}={}", kind, backend.name()))
            .collect();
        f.debug_struct("BackendRegistry")
            .field("backends", &names)
            .finish()
    }
}
