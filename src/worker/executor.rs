use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use crate::scheduler::job::{JobKind, JobPayload};
use crate::worker::backend::{BackendError, BackendRegistry};

/// Why a single attempt did not produce a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler task aborted")]
    Aborted,

    #[error("no execution backend registered for kind {0}")]
    NoBackend(JobKind),
}

impl AttemptError {
    /// Failures that no retry can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AttemptError::NoBackend(_))
    }
}

/// Runs one attempt against the registered backend for a job kind.
///
/// Every attempt runs on its own task so that a panicking handler is
/// reported as a failure instead of tearing down the caller, and the
/// optional timeout aborts handlers that never return.
#[derive(Debug, Clone)]
pub struct AttemptExecutor {
    backends: BackendRegistry,
    timeout: Option<Duration>,
}

impl AttemptExecutor {
    pub fn new(backends: BackendRegistry, timeout: Option<Duration>) -> Self {
        Self { backends, timeout }
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub async fn execute(
        &self,
        job_id: &str,
        kind: &JobKind,
        payload: &JobPayload,
        attempt: u32,
    ) -> Result<String, AttemptError> {
        let backend = self
            .backends
            .get(kind)
            .ok_or_else(|| AttemptError::NoBackend(kind.clone()))?;

        tracing::info!(job_id, kind = %kind, attempt, backend = backend.name(), "Executing job");

        let task_kind = kind.clone();
        let task_payload = payload.clone();
        let mut handle =
            tokio::spawn(async move { backend.execute(&task_kind, &task_payload).await });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    tracing::warn!(job_id, attempt, timeout = ?limit, "Job attempt timed out");
                    return Err(AttemptError::TimedOut(limit));
                }
            },
            None => handle.await,
        };

        Self::process_output(job_id, attempt, joined)
    }

    fn process_output(
        job_id: &str,
        attempt: u32,
        joined: Result<Result<String, BackendError>, JoinError>,
    ) -> Result<String, AttemptError> {
        match joined {
            Ok(Ok(result_ref)) => {
                tracing::info!(job_id, attempt, result_ref = %result_ref, "Job attempt succeeded");
                Ok(result_ref)
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id, attempt, error = %e, "Job attempt failed");
                Err(AttemptError::Backend(e))
            }
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(job_id, attempt, panic = %message, "Job handler panicked");
                Err(AttemptError::Panicked(message))
            }
            Err(e) => {
                tracing::error!(job_id, attempt, error = %e, "Job handler task aborted");
                Err(AttemptError::Aborted)
            }
        }
    }
}
