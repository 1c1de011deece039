//! Job storage.
//!
//! [`JobStore`] is the single source of truth for job state. Every operation
//! is atomic with respect to the others, but the store never merges: a `put`
//! replaces the whole record. Read-modify-write sequences on one id are
//! serialized by the [`Runner`](crate::scheduler::Runner), not here.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::scheduler::job::{JobId, JobRecord, JobStatus, OwnerScope};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or overwrite the record with the same id.
    async fn put(&self, record: JobRecord) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;

    async fn list_by_owner(&self, owner: &OwnerScope) -> Result<Vec<JobRecord>>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &JobId) -> Result<bool>;

    async fn len(&self) -> Result<usize>;
}

/// Sharded in-process store. Locks are held per shard for the duration of a
/// single call, so unrelated jobs never wait on each other.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, JobRecord>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, record: JobRecord) -> Result<()> {
        self.jobs.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_by_owner(&self, owner: &OwnerScope) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| &entry.owner == owner)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete(&self, id: &JobId) -> Result<bool> {
        Ok(self.jobs.remove(id).is_some())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.jobs.len())
    }
}
