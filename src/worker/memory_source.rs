use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::scheduler::job::JobStatus;
use crate::worker::poll::{PendingJob, PendingSource, StatusUpdate};

/// A row and its recorded state.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub job: PendingJob,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    seq: u64,
}

/// In-process [`PendingSource`] for demos and tests. Behaves like a table
/// with a status column: claims are compare-and-set on `pending`.
#[derive(Debug, Default)]
pub struct MemorySource {
    rows: RwLock<HashMap<String, SourceRow>>,
    next_seq: AtomicU64,
    unavailable: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: PendingJob) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let row = SourceRow {
            job,
            status: JobStatus::Queued,
            last_error: None,
            result_ref: None,
            completed_at: None,
            seq,
        };
        self.rows
            .write()
            .await
            .insert(row.job.external_id.clone(), row);
    }

    pub async fn row(&self, external_id: &str) -> Option<SourceRow> {
        self.rows.read().await.get(external_id).cloned()
    }

    pub async fn count_with_status(&self, status: JobStatus) -> usize {
        self.rows
            .read()
            .await
            .values()
            .filter(|row| row.status == status)
            .count()
    }

    /// Make every call fail as if the datastore were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Source("source unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PendingSource for MemorySource {
    async fn fetch_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingJob>> {
        self.check_available()?;
        let rows = self.rows.read().await;
        let mut due: Vec<&SourceRow> = rows
            .values()
            .filter(|row| row.status == JobStatus::Queued && row.job.is_due(now))
            .collect();
        due.sort_by_key(|row| (row.job.scheduled_at, row.seq));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|row| row.job.clone())
            .collect())
    }

    async fn mark_status(&self, external_id: &str, update: StatusUpdate) -> Result<bool> {
        self.check_available()?;
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(external_id) else {
            return Ok(false);
        };
        if update.status == JobStatus::Processing && row.status != JobStatus::Queued {
            return Ok(false);
        }

        row.status = update.status;
        row.job.attempt = update.attempt;
        row.job.scheduled_at = update.scheduled_at.or(row.job.scheduled_at);
        row.last_error = update.last_error;
        row.result_ref = update.result_ref;
        row.completed_at = update.completed_at;
        Ok(true)
    }
}
