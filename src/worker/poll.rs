//! Poll-mode worker.
//!
//! Instead of receiving submissions, a [`PollAdapter`] periodically asks an
//! external [`PendingSource`] for due rows, claims each one, runs it through
//! the same attempt and retry logic as the in-process runner, and writes the
//! outcome back to the source. A retried row goes back to pending with a
//! `scheduled_at` in the future, so the backoff survives worker restarts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PollConfig;
use crate::error::Result;
use crate::scheduler::job::{JobKind, JobPayload, JobStatus};
use crate::scheduler::retry::{RetryDecision, RetryPolicy};
use crate::worker::backend::BackendRegistry;
use crate::worker::executor::{AttemptError, AttemptExecutor};

/// A row of pending work as the external source stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingJob {
    pub external_id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    /// Attempts already made by any worker
    #[serde(default)]
    pub attempt: u32,
    /// Row-specific ceiling; the worker's configured ceiling applies when unset
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// The row is not due before this time
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl PendingJob {
    pub fn new(external_id: impl Into<String>, kind: JobKind, payload: JobPayload) -> Self {
        Self {
            external_id: external_id.into(),
            kind,
            payload,
            attempt: 0,
            max_attempts: None,
            scheduled_at: None,
        }
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }
}

/// Fields written back to the source on every status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    /// Next due time of a row put back to pending
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Claim for `attempt`. Sources apply it only to rows still pending.
    pub fn processing(attempt: u32) -> Self {
        Self {
            status: JobStatus::Processing,
            attempt,
            last_error: None,
            result_ref: None,
            scheduled_at: None,
            completed_at: None,
        }
    }

    pub fn completed(attempt: u32, result_ref: String, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Completed,
            attempt,
            last_error: None,
            result_ref: Some(result_ref),
            scheduled_at: None,
            completed_at: Some(at),
        }
    }

    pub fn retry(attempt: u32, error: String, due: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Queued,
            attempt,
            last_error: Some(error),
            result_ref: None,
            scheduled_at: Some(due),
            completed_at: None,
        }
    }

    pub fn failed(attempt: u32, error: String, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Failed,
            attempt,
            last_error: Some(error),
            result_ref: None,
            scheduled_at: None,
            completed_at: Some(at),
        }
    }
}

/// External datastore holding pending work, owned by the surrounding
/// persistence layer.
#[async_trait]
pub trait PendingSource: Send + Sync {
    /// Up to `limit` pending rows that are due at `now`.
    async fn fetch_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingJob>>;

    /// Write `update` to a row. A [`JobStatus::Processing`] update is an
    /// optimistic claim and returns `Ok(false)` when the row is no longer
    /// pending (another worker claimed it).
    async fn mark_status(&self, external_id: &str, update: StatusUpdate) -> Result<bool>;
}

/// Counts for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub claimed: usize,
    pub skipped: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Completed,
    Retried,
    Failed,
    Unrecorded,
}

#[derive(Clone)]
pub struct PollAdapter {
    source: Arc<dyn PendingSource>,
    executor: AttemptExecutor,
    policy: RetryPolicy,
    config: PollConfig,
}

impl PollAdapter {
    pub fn new(
        source: Arc<dyn PendingSource>,
        backends: BackendRegistry,
        policy: RetryPolicy,
        config: PollConfig,
    ) -> Self {
        Self {
            executor: AttemptExecutor::new(backends, config.attempt_timeout),
            source,
            policy,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Fetch, claim and execute one batch. Rows of the batch run
    /// concurrently; the call returns once every claimed row is recorded.
    ///
    /// # Errors
    ///
    /// Only a failed fetch is an error. Per-row failures are counted in the
    /// report and logged.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let now = Utc::now();
        let rows = self
            .source
            .fetch_pending(now, self.config.batch_size)
            .await?;
        let mut report = PollReport {
            fetched: rows.len(),
            ..Default::default()
        };

        let mut running = JoinSet::new();
        for row in rows {
            let max_attempts = row
                .max_attempts
                .unwrap_or(self.config.max_attempts)
                .max(1);

            if row.attempt >= max_attempts {
                let update = StatusUpdate::failed(
                    row.attempt,
                    "attempts exhausted".to_string(),
                    Utc::now(),
                );
                match self.source.mark_status(&row.external_id, update).await {
                    Ok(_) => report.failed += 1,
                    Err(e) => {
                        tracing::warn!(worker = %self.config.name, job_id = %row.external_id, error = %e, "Failed to fail exhausted row");
                        report.skipped += 1;
                    }
                }
                continue;
            }

            let attempt = row.attempt + 1;
            match self
                .source
                .mark_status(&row.external_id, StatusUpdate::processing(attempt))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(worker = %self.config.name, job_id = %row.external_id, "Row claimed elsewhere, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(worker = %self.config.name, job_id = %row.external_id, error = %e, "Failed to claim row");
                    report.skipped += 1;
                    continue;
                }
            }
            report.claimed += 1;

            let adapter = self.clone();
            running.spawn(async move { adapter.process(row, attempt, max_attempts).await });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(RowOutcome::Completed) => report.completed += 1,
                Ok(RowOutcome::Retried) => report.retried += 1,
                Ok(RowOutcome::Failed) => report.failed += 1,
                Ok(RowOutcome::Unrecorded) => {}
                Err(e) => {
                    tracing::error!(worker = %self.config.name, error = %e, "Poll row task failed");
                }
            }
        }

        Ok(report)
    }

    async fn process(&self, row: PendingJob, attempt: u32, max_attempts: u32) -> RowOutcome {
        let outcome = self
            .executor
            .execute(&row.external_id, &row.kind, &row.payload, attempt)
            .await;
        let now = Utc::now();

        let (update, result) = match outcome {
            Ok(result_ref) => (
                StatusUpdate::completed(attempt, result_ref, now),
                RowOutcome::Completed,
            ),
            Err(e) => match self.decide(&e, attempt, max_attempts) {
                RetryDecision::Retry(delay) => {
                    let delay = self.policy.jittered(delay);
                    let due = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    tracing::info!(
                        worker = %self.config.name,
                        job_id = %row.external_id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying row"
                    );
                    (
                        StatusUpdate::retry(attempt, e.to_string(), due),
                        RowOutcome::Retried,
                    )
                }
                RetryDecision::GiveUp => {
                    tracing::error!(
                        worker = %self.config.name,
                        job_id = %row.external_id,
                        attempt,
                        error = %e,
                        "Row failed after exhausting attempts"
                    );
                    (
                        StatusUpdate::failed(attempt, e.to_string(), now),
                        RowOutcome::Failed,
                    )
                }
            },
        };

        match self.source.mark_status(&row.external_id, update).await {
            Ok(_) => result,
            Err(e) => {
                tracing::error!(
                    worker = %self.config.name,
                    job_id = %row.external_id,
                    error = %e,
                    "Failed to record row outcome"
                );
                RowOutcome::Unrecorded
            }
        }
    }

    fn decide(&self, error: &AttemptError, attempt: u32, max_attempts: u32) -> RetryDecision {
        if error.is_permanent() {
            return RetryDecision::GiveUp;
        }
        self.policy.decide(attempt, max_attempts)
    }

    /// Poll every `interval` until `shutdown` is cancelled. A failed cycle
    /// is logged and retried at the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(worker = %self.config.name, interval = ?self.config.interval, "Poll worker started");
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report.fetched > 0 => {
                            tracing::info!(
                                worker = %self.config.name,
                                fetched = report.fetched,
                                claimed = report.claimed,
                                skipped = report.skipped,
                                completed = report.completed,
                                retried = report.retried,
                                failed = report.failed,
                                "Poll cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(worker = %self.config.name, error = %e, "Poll cycle failed, retrying next interval");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(worker = %self.config.name, "Poll worker stopped");
                    break;
                }
            }
        }
    }
}
