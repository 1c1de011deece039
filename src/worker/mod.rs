//! Execution side of the engine.
//!
//! - [`ExecutionBackend`]: capability that performs the work for a job kind
//! - [`BackendRegistry`]: kind to backend routing, fixed at startup
//! - [`AttemptExecutor`]: runs one attempt with timeout and panic isolation
//! - [`PollAdapter`]: worker that pulls due rows from a [`PendingSource`]
//!
//! # Poll Flow
//!
//! 1. Fetch up to `batch_size` due rows from the source
//! 2. Claim each row by marking it processing (skip rows claimed elsewhere)
//! 3. Execute claimed rows concurrently through [`AttemptExecutor`]
//! 4. Write completed, retry-at, or failed back to the source

pub mod backend;
pub mod executor;
pub mod memory_source;
pub mod poll;
pub mod simulated;

pub use backend::{BackendError, BackendRegistry, ExecutionBackend};
pub use executor::{AttemptError, AttemptExecutor};
pub use memory_source::MemorySource;
pub use poll::{PendingJob, PendingSource, PollAdapter, PollReport, StatusUpdate};
pub use simulated::SimulatedBackend;
