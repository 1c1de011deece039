use thiserror::Error;

use crate::scheduler::job::{JobId, JobKind};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("No execution backend registered for kind: {0}")]
    UnknownKind(JobKind),

    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Pending source error: {0}")]
    Source(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
