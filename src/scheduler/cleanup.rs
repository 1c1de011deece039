//! Retention of terminal jobs.
//!
//! Completed and failed jobs are deleted once their `updated_at` is older
//! than the retention window. Queued and processing jobs are never touched.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::CleanupConfig;
use crate::error::Result;
use crate::scheduler::job::{JobId, JobStatus};
use crate::scheduler::runner::Runner;
use crate::scheduler::store::JobStore;

/// Delete every terminal job with `now - updated_at > retention` and return
/// the removed ids.
pub async fn sweep_terminal(
    store: &dyn JobStore,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<Vec<JobId>> {
    // A window too large to represent can never be exceeded.
    let Some(cutoff) = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
    else {
        return Ok(Vec::new());
    };

    let mut removed = Vec::new();
    for status in [JobStatus::Completed, JobStatus::Failed] {
        for job in store.list_by_status(status).await? {
            if job.updated_at < cutoff && store.delete(&job.id).await? {
                removed.push(job.id);
            }
        }
    }
    Ok(removed)
}

/// Periodic sweep owned by the node.
pub struct CleanupTask {
    runner: Runner,
    config: CleanupConfig,
}

impl CleanupTask {
    pub fn new(runner: Runner, config: CleanupConfig) -> Self {
        Self { runner, config }
    }

    /// Run one sweep with the configured retention.
    pub async fn run_once(&self) -> Result<usize> {
        let removed = self.runner.sweep(self.config.retention).await?;
        if removed > 0 {
            tracing::info!(removed, retention = ?self.config.retention, "Swept terminal jobs");
        } else {
            tracing::debug!("Job sweep found nothing to remove");
        }
        Ok(removed)
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(error = %e, "Job sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("Cleanup loop stopped");
                    break;
                }
            }
        }
    }
}
