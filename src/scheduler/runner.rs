use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::{EngineError, Result};
use crate::scheduler::cleanup::sweep_terminal;
use crate::scheduler::job::{JobId, JobKind, JobPayload, JobRecord, JobStatus, OwnerScope};
use crate::scheduler::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::store::JobStore;
use crate::worker::backend::BackendRegistry;
use crate::worker::executor::AttemptExecutor;

/// `last_error` of a job cancelled by its submitter.
pub const CANCELLED_REASON: &str = "cancelled";

/// `last_error` of a job whose attempt was cut short by a process restart.
pub const INTERRUPTED_REASON: &str = "interrupted";

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed
    }
}

/// Drives jobs through `Queued -> Processing -> {Completed | Queued | Failed}`.
///
/// Cheap to clone; all clones share the same store, backends and shutdown
/// token. Each attempt runs on its own task and retry delays are timers, so
/// one slow or backing-off job never holds up another.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    store: Arc<dyn JobStore>,
    executor: AttemptExecutor,
    policy: RetryPolicy,
    default_max_attempts: u32,
    permits: Arc<Semaphore>,
    // Held for the whole read-modify-write of a transition, never across an attempt.
    guards: DashMap<JobId, Arc<Mutex<()>>>,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(store: Arc<dyn JobStore>, backends: BackendRegistry, config: RunnerConfig) -> Self {
        Self::with_shutdown(store, backends, config, CancellationToken::new())
    }

    /// Build a runner that stops scheduling retries once `shutdown` is cancelled.
    pub fn with_shutdown(
        store: Arc<dyn JobStore>,
        backends: BackendRegistry,
        config: RunnerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                executor: AttemptExecutor::new(backends, config.attempt_timeout),
                policy: RetryPolicy::from_config(&config.retry),
                default_max_attempts: config.retry.default_max_attempts,
                permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                guards: DashMap::new(),
                shutdown,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn backends(&self) -> &BackendRegistry {
        self.inner.executor.backends()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Stop accepting submissions and abandon pending retry timers. Jobs
    /// waiting for a retry stay `Queued` in the store.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Create a job and start its first attempt immediately.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the kind has no backend, `max_attempts` is
    /// zero, or the payload is rejected. Execution failures are never
    /// reported here; they surface through the job's status.
    pub async fn submit(
        &self,
        kind: JobKind,
        owner: OwnerScope,
        payload: JobPayload,
        max_attempts: Option<u32>,
    ) -> Result<JobId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let backend = self
            .backends()
            .get(&kind)
            .ok_or_else(|| EngineError::UnknownKind(kind.clone()))?;

        let max_attempts = max_attempts.unwrap_or(self.inner.default_max_attempts);
        if max_attempts == 0 {
            return Err(EngineError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if kind.requires_prompt() && payload.prompt.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "{} jobs require a prompt",
                kind
            )));
        }
        backend
            .validate(&kind, &payload)
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let record = JobRecord::new(kind, owner, payload, max_attempts);
        let id = record.id;
        tracing::info!(
            job_id = %id,
            kind = %record.kind,
            org_id = %record.owner.org_id,
            max_attempts,
            "Job submitted"
        );
        self.inner.store.put(record).await?;
        self.inner.dispatch(id, None);
        Ok(id)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<JobRecord> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(EngineError::JobNotFound(*id))
    }

    pub async fn list_by_owner(&self, owner: &OwnerScope) -> Result<Vec<JobRecord>> {
        self.inner.store.list_by_owner(owner).await
    }

    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        self.inner.store.list_by_status(status).await
    }

    /// Mark a non-terminal job `Failed` with reason `"cancelled"`.
    ///
    /// Returns `Ok(false)` when the job is already terminal. An attempt that
    /// is still in flight keeps running, but its result is discarded.
    pub async fn cancel(&self, id: &JobId) -> Result<bool> {
        let applied = self
            .inner
            .update(id, |job| {
                if job.is_terminal() {
                    return None;
                }
                job.status = JobStatus::Failed;
                job.last_error = Some(CANCELLED_REASON.to_string());
                job.result_ref = None;
                Some(())
            })
            .await?;

        if let Some(((), job)) = &applied {
            tracing::info!(job_id = %id, attempt = job.attempt, "Job cancelled");
        }
        Ok(applied.is_some())
    }

    /// Delete terminal jobs last updated more than `retention` ago.
    pub async fn sweep(&self, retention: Duration) -> Result<usize> {
        self.sweep_at(Utc::now(), retention).await
    }

    /// [`sweep`](Self::sweep) against an explicit reference time.
    pub async fn sweep_at(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let removed = sweep_terminal(self.inner.store.as_ref(), now, retention).await?;
        for id in &removed {
            self.inner.release_guard(id);
        }
        Ok(removed.len())
    }

    pub async fn stats(&self) -> Result<JobStats> {
        let store = &self.inner.store;
        Ok(JobStats {
            queued: store.list_by_status(JobStatus::Queued).await?.len(),
            processing: store.list_by_status(JobStatus::Processing).await?.len(),
            completed: store.list_by_status(JobStatus::Completed).await?.len(),
            failed: store.list_by_status(JobStatus::Failed).await?.len(),
        })
    }

    /// Restart recovery for durable stores. Call once at startup, before any
    /// submission.
    ///
    /// Jobs left `Processing` by a previous process are re-queued (or failed
    /// if the interrupted attempt was their last), then every `Queued` job is
    /// dispatched. Returns the number of jobs dispatched.
    pub async fn resume_pending(&self) -> Result<usize> {
        for job in self.inner.store.list_by_status(JobStatus::Processing).await? {
            let outcome = self
                .inner
                .update(&job.id, |job| {
                    if job.status != JobStatus::Processing {
                        return None;
                    }
                    job.last_error = Some(INTERRUPTED_REASON.to_string());
                    job.status = if job.attempts_exhausted() {
                        JobStatus::Failed
                    } else {
                        JobStatus::Queued
                    };
                    Some(job.status)
                })
                .await?;
            if let Some((status, job)) = outcome {
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    status = %status,
                    "Recovered interrupted job"
                );
            }
        }

        let queued = self.inner.store.list_by_status(JobStatus::Queued).await?;
        for job in &queued {
            self.inner.dispatch(job.id, None);
        }
        if !queued.is_empty() {
            tracing::info!(count = queued.len(), "Resumed queued jobs");
        }
        Ok(queued.len())
    }
}

impl RunnerInner {
    fn guard(&self, id: &JobId) -> Arc<Mutex<()>> {
        self.guards
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the guard of a job that will never transition again, unless
    /// another caller still holds it.
    fn release_guard(&self, id: &JobId) {
        self.guards.remove_if(id, |_, guard| Arc::strong_count(guard) == 1);
    }

    /// Read-modify-write one record while holding its transition guard.
    ///
    /// `apply` returns `None` to leave the record untouched. Otherwise the
    /// record is stamped, stored whole, and returned with `apply`'s value.
    /// The guard is released once the record is missing or terminal.
    async fn update<T>(
        &self,
        id: &JobId,
        apply: impl FnOnce(&mut JobRecord) -> Option<T>,
    ) -> Result<Option<(T, JobRecord)>> {
        let guard = self.guard(id);
        let (outcome, settled) = {
            let _held = guard.lock().await;
            match self.store.get(id).await {
                Err(e) => (Err(e), false),
                Ok(None) => (Err(EngineError::JobNotFound(*id)), true),
                Ok(Some(mut record)) => match apply(&mut record) {
                    None => (Ok(None), record.is_terminal()),
                    Some(value) => {
                        record.touch();
                        match self.store.put(record.clone()).await {
                            Ok(()) => {
                                let settled = record.is_terminal();
                                (Ok(Some((value, record))), settled)
                            }
                            Err(e) => (Err(e), false),
                        }
                    }
                },
            }
        };

        drop(guard);
        if settled {
            self.release_guard(id);
        }
        outcome
    }

    fn dispatch(self: &Arc<Self>, id: JobId, delay: Option<Duration>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.shutdown.cancelled() => {
                        tracing::info!(job_id = %id, "Shutdown during backoff, job left queued");
                        return;
                    }
                }
            }
            inner.run_attempt(id).await;
        });
    }

    async fn run_attempt(self: Arc<Self>, id: JobId) {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };

        let started = self
            .update(&id, |job| {
                if job.status != JobStatus::Queued {
                    return None;
                }
                job.status = JobStatus::Processing;
                job.attempt += 1;
                Some((job.kind.clone(), job.payload.clone(), job.attempt))
            })
            .await;

        let (kind, payload, attempt) = match started {
            Ok(Some((started, _))) => started,
            Ok(None) => {
                tracing::debug!(job_id = %id, "Job no longer queued, attempt skipped");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to start job attempt");
                return;
            }
        };

        let outcome = self
            .executor
            .execute(&id.to_string(), &kind, &payload, attempt)
            .await;

        let policy = &self.policy;
        let finished = self
            .update(&id, |job| {
                // Cancelled (or recovered) while the attempt was in flight.
                if job.status != JobStatus::Processing || job.attempt != attempt {
                    return None;
                }
                match &outcome {
                    Ok(result_ref) => {
                        job.status = JobStatus::Completed;
                        job.result_ref = Some(result_ref.clone());
                        job.last_error = None;
                        Some(None)
                    }
                    Err(e) => {
                        job.last_error = Some(e.to_string());
                        let decision = if e.is_permanent() {
                            RetryDecision::GiveUp
                        } else {
                            policy.decide(job.attempt, job.max_attempts)
                        };
                        match decision {
                            RetryDecision::Retry(delay) => {
                                job.status = JobStatus::Queued;
                                Some(Some(policy.jittered(delay)))
                            }
                            RetryDecision::GiveUp => {
                                job.status = JobStatus::Failed;
                                Some(None)
                            }
                        }
                    }
                }
            })
            .await;

        match finished {
            Ok(Some((Some(delay), job))) => {
                tracing::info!(
                    job_id = %id,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying job"
                );
                self.dispatch(id, Some(delay));
            }
            Ok(Some((None, job))) if job.status == JobStatus::Completed => {
                tracing::info!(job_id = %id, attempt = job.attempt, "Job completed");
            }
            Ok(Some((None, job))) => {
                tracing::error!(
                    job_id = %id,
                    attempt = job.attempt,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "Job failed after exhausting attempts"
                );
            }
            Ok(None) => {
                tracing::info!(job_id = %id, attempt, "Job no longer processing, attempt result discarded");
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to record job attempt");
            }
        }
    }
}
