pub mod cleanup;
pub mod job;
pub mod retry;
pub mod runner;
pub mod store;

pub use cleanup::CleanupTask;
pub use job::{JobId, JobKind, JobPayload, JobRecord, JobStatus, OwnerScope};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{JobStats, Runner, CANCELLED_REASON, INTERRUPTED_REASON};
pub use store::{InMemoryJobStore, JobStore};
