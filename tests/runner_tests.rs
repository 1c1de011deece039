
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;

use fusion_jobs::config::RunnerConfig;
use fusion_jobs::scheduler::{
    InMemoryJobStore, JobId, JobKind, JobPayload, JobRecord, JobStatus, JobStore, OwnerScope,
    Runner, CANCELLED_REASON, INTERRUPTED_REASON,
};
use fusion_jobs::worker::BackendRegistry;
use fusion_jobs::EngineError;
use test_harness::{
    fast_retry, owner, submit_text, test_runner, test_runner_with, wait_for, wait_for_status,
    FailingStore, PanickingBackend, ScriptedBackend,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_always_failing_job_fails_after_max_attempts() {
    let backend = ScriptedBackend::always_failing();
    let runner = test_runner(backend.clone(), 5);

    let id = submit_text(&runner, 3).await;
    let job = wait_for_status(&runner, id, JobStatus::Failed, WAIT).await;

    assert_eq!(job.attempt, 3);
    assert_eq!(job.last_error.as_deref(), Some("scripted failure 3"));
    assert!(job.result_ref.is_none());
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_job_succeeds_after_two_failures() {
    let backend = ScriptedBackend::failing(2);
    let runner = test_runner(backend.clone(), 5);

    let id = submit_text(&runner, 3).await;
    let job = wait_for_status(&runner, id, JobStatus::Completed, WAIT).await;

    assert_eq!(job.attempt, 3);
    assert_eq!(job.result_ref.as_deref(), Some("asset_3"));
    assert!(job.last_error.is_none());
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_attempts_never_exceed_ceiling() {
    let backend = ScriptedBackend::always_failing();
    let runner = test_runner(backend.clone(), 2);

    let id = submit_text(&runner, 4).await;
    wait_for_status(&runner, id, JobStatus::Failed, WAIT).await;

    // Give any stray retry timer a chance to fire
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.calls(), 4);
    assert_eq!(runner.get_job(&id).await.unwrap().attempt, 4);
}

#[tokio::test]
async fn test_single_attempt_job_is_not_retried() {
    let backend = ScriptedBackend::always_failing();
    let runner = test_runner(backend.clone(), 5);

    let id = submit_text(&runner, 1).await;
    let job = wait_for_status(&runner, id, JobStatus::Failed, WAIT).await;

    assert_eq!(job.attempt, 1);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_retry_delays_double() {
    let backend = ScriptedBackend::failing(2);
    let runner = test_runner(backend.clone(), 40);

    let id = submit_text(&runner, 3).await;
    wait_for_status(&runner, id, JobStatus::Completed, WAIT).await;

    let gaps = backend.gaps();
    assert_eq!(gaps.len(), 2);
    assert!(
        gaps[0] >= Duration::from_millis(40),
        "first retry came after {:?}",
        gaps[0]
    );
    assert!(
        gaps[1] >= Duration::from_millis(80),
        "second retry came after {:?}",
        gaps[1]
    );
}

#[tokio::test]
async fn test_job_waits_queued_during_backoff() {
    let backend = ScriptedBackend::failing(1);
    let runner = test_runner(backend.clone(), 300);

    let id = submit_text(&runner, 2).await;
    let waiting = wait_for(
        || {
            let runner = runner.clone();
            let backend = backend.clone();
            async move {
                let job = runner.get_job(&id).await.unwrap();
                backend.calls() == 1 && job.status == JobStatus::Queued
            }
        },
        WAIT,
        Duration::from_millis(5),
    )
    .await;
    assert!(waiting, "job never went back to queued");

    let job = runner.get_job(&id).await.unwrap();
    assert_eq!(job.attempt, 1);
    assert_eq!(job.last_error.as_deref(), Some("scripted failure 1"));

    let job = wait_for_status(&runner, id, JobStatus::Completed, WAIT).await;
    assert_eq!(job.attempt, 2);
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn test_cancel_discards_in_flight_result() {
    let backend = ScriptedBackend::slow(Duration::from_millis(150));
    let runner = test_runner(backend.clone(), 5);

    let id = submit_text(&runner, 3).await;
    let in_flight = wait_for(
        || {
            let runner = runner.clone();
            let backend = backend.clone();
            async move {
                let job = runner.get_job(&id).await.unwrap();
                backend.calls() == 1 && job.status == JobStatus::Processing
            }
        },
        WAIT,
        Duration::from_millis(2),
    )
    .await;
    assert!(in_flight, "attempt never started");

    assert!(runner.cancel(&id).await.unwrap());
    let cancelled = runner.get_job(&id).await.unwrap();

    // The slow handler succeeds after the cancel
    tokio::time::sleep(Duration::from_millis(300)).await;

    let job = runner.get_job(&id).await.unwrap();
    assert_eq!(backend.calls(), 1);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some(CANCELLED_REASON));
    assert!(job.result_ref.is_none());
    assert_eq!(job.attempt, 1);
    assert_eq!(job.updated_at, cancelled.updated_at);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let backend = ScriptedBackend::slow(Duration::from_millis(200));
    let runner = test_runner(backend, 5);

    let id = submit_text(&runner, 3).await;
    assert!(runner.cancel(&id).await.unwrap());
    assert!(!runner.cancel(&id).await.unwrap());

    let job = runner.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some(CANCELLED_REASON));
}

#[tokio::test]
async fn test_cancel_during_backoff_stops_retries() {
    let backend = ScriptedBackend::always_failing();
    let runner = test_runner(backend.clone(), 100);

    let id = submit_text(&runner, 5).await;
    let failed_once = wait_for(
        || {
            let runner = runner.clone();
            let backend = backend.clone();
            async move {
                let job = runner.get_job(&id).await.unwrap();
                backend.calls() == 1 && job.status == JobStatus::Queued
            }
        },
        WAIT,
        Duration::from_millis(2),
    )
    .await;
    assert!(failed_once);

    assert!(runner.cancel(&id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;

    let job = runner.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some(CANCELLED_REASON));
    assert_eq!(job.attempt, 1);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_terminal_job_is_stable() {
    let runner = test_runner(ScriptedBackend::succeeding(), 5);

    let id = submit_text(&runner, 3).await;
    let completed = wait_for_status(&runner, id, JobStatus::Completed, WAIT).await;

    assert!(!runner.cancel(&id).await.unwrap());

    let after = runner.get_job(&id).await.unwrap();
    assert_eq!(after.status, completed.status);
    assert_eq!(after.result_ref, completed.result_ref);
    assert_eq!(after.last_error, completed.last_error);
    assert_eq!(after.updated_at, completed.updated_at);
}

#[tokio::test]
async fn test_concurrent_submits_all_complete() {
    let runner = test_runner(ScriptedBackend::succeeding(), 5);

    let mut submits = JoinSet::new();
    for i in 0..100 {
        let runner = runner.clone();
        submits.spawn(async move {
            runner
                .submit(
                    JobKind::Text,
                    OwnerScope::new("org-1", format!("user-{}", i % 7)),
                    JobPayload::prompt(format!("prompt {}", i)),
                    None,
                )
                .await
                .unwrap()
        });
    }

    let mut ids: Vec<JobId> = Vec::new();
    while let Some(joined) = submits.join_next().await {
        ids.push(joined.unwrap());
    }
    let mut distinct = ids.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 100);

    for id in &ids {
        wait_for_status(&runner, *id, JobStatus::Completed, WAIT).await;
    }
    assert_eq!(runner.store().len().await.unwrap(), 100);
    assert_eq!(runner.stats().await.unwrap().completed, 100);
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let runner = test_runner(ScriptedBackend::succeeding(), 5);
    let missing = JobId::new();

    assert!(matches!(
        runner.get_job(&missing).await,
        Err(EngineError::JobNotFound(id)) if id == missing
    ));
    assert!(matches!(
        runner.cancel(&missing).await,
        Err(EngineError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_submit_rejects_invalid_jobs() {
    let backend = ScriptedBackend::succeeding();
    let runner = test_runner(backend.clone(), 5);

    let unknown = runner
        .submit(JobKind::Video, owner(), JobPayload::prompt("a trailer"), None)
        .await;
    assert!(matches!(unknown, Err(EngineError::UnknownKind(JobKind::Video))));

    let zero = runner
        .submit(JobKind::Text, owner(), JobPayload::prompt("a tagline"), Some(0))
        .await;
    assert!(matches!(zero, Err(EngineError::Validation(_))));

    let empty = runner
        .submit(JobKind::Text, owner(), JobPayload::prompt("   "), None)
        .await;
    assert!(matches!(empty, Err(EngineError::Validation(_))));

    // Rejected submissions never become jobs
    assert_eq!(runner.store().len().await.unwrap(), 0);
    assert_eq!(backend.calls(), 0);

    // Generic tasks carry no prompt
    let id = runner
        .submit(JobKind::task("render"), owner(), JobPayload::default(), None)
        .await
        .unwrap();
    wait_for_status(&runner, id, JobStatus::Completed, WAIT).await;
}

#[tokio::test]
async fn test_panicking_handler_counts_as_failure() {
    let runner = test_runner(Arc::new(PanickingBackend), 5);

    let id = submit_text(&runner, 2).await;
    let job = wait_for_status(&runner, id, JobStatus::Failed, WAIT).await;

    assert_eq!(job.attempt, 2);
    let error = job.last_error.unwrap();
    assert!(error.contains("provider client exploded"), "got {}", error);
}

#[tokio::test]
async fn test_hung_attempt_times_out() {
    let config = RunnerConfig::default()
        .with_retry(fast_retry(5))
        .with_attempt_timeout(Some(Duration::from_millis(50)));
    let runner = test_runner_with(ScriptedBackend::slow(Duration::from_secs(30)), config);

    let id = submit_text(&runner, 2).await;
    let job = wait_for_status(&runner, id, JobStatus::Failed, WAIT).await;

    assert_eq!(job.attempt, 2);
    let error = job.last_error.unwrap();
    assert!(error.contains("timed out"), "got {}", error);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let backend = ScriptedBackend::slow(Duration::from_millis(50));
    let config = RunnerConfig::default()
        .with_retry(fast_retry(5))
        .with_max_concurrency(1);
    let runner = test_runner_with(backend, config);

    let start = Instant::now();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(submit_text(&runner, 1).await);
    }
    for id in ids {
        wait_for_status(&runner, id, JobStatus::Completed, WAIT).await;
    }
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_list_by_owner_and_status() {
    let backend = ScriptedBackend::succeeding();
    let runner = test_runner(backend, 5);

    let a1 = submit_text(&runner, 1).await;
    let a2 = submit_text(&runner, 1).await;
    let b1 = runner
        .submit(
            JobKind::Text,
            OwnerScope::new("org-2", "user-9"),
            JobPayload::prompt("other tenant"),
            None,
        )
        .await
        .unwrap();
    for id in [a1, a2, b1] {
        wait_for_status(&runner, id, JobStatus::Completed, WAIT).await;
    }

    let mut mine: Vec<JobId> = runner
        .list_by_owner(&owner())
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    mine.sort();
    let mut expected = vec![a1, a2];
    expected.sort();
    assert_eq!(mine, expected);

    assert_eq!(runner.list_by_status(JobStatus::Completed).await.unwrap().len(), 3);
    assert!(runner.list_by_status(JobStatus::Queued).await.unwrap().is_empty());

    let stats = runner.stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.total(), 3);
}

#[tokio::test]
async fn test_resume_pending_recovers_interrupted_jobs() {
    let store = Arc::new(InMemoryJobStore::new());
    let now = Utc::now();

    let mut retryable = JobRecord::with_id(
        JobId::new(),
        JobKind::Text,
        owner(),
        JobPayload::prompt("interrupted once"),
        3,
        now,
    );
    retryable.status = JobStatus::Processing;
    retryable.attempt = 1;

    let mut exhausted = JobRecord::with_id(
        JobId::new(),
        JobKind::Text,
        owner(),
        JobPayload::prompt("interrupted on last attempt"),
        3,
        now,
    );
    exhausted.status = JobStatus::Processing;
    exhausted.attempt = 3;

    let queued = JobRecord::with_id(
        JobId::new(),
        JobKind::Text,
        owner(),
        JobPayload::prompt("never started"),
        3,
        now,
    );

    for record in [retryable.clone(), exhausted.clone(), queued.clone()] {
        store.put(record).await.unwrap();
    }

    let backends = BackendRegistry::new().register(JobKind::Text, ScriptedBackend::succeeding());
    let runner = Runner::new(
        store,
        backends,
        RunnerConfig::default().with_retry(fast_retry(5)),
    );

    assert_eq!(runner.resume_pending().await.unwrap(), 2);

    let job = wait_for_status(&runner, retryable.id, JobStatus::Completed, WAIT).await;
    assert_eq!(job.attempt, 2);

    let job = runner.get_job(&exhausted.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some(INTERRUPTED_REASON));
    assert_eq!(job.attempt, 3);

    let job = wait_for_status(&runner, queued.id, JobStatus::Completed, WAIT).await;
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn test_resumed_job_without_backend_fails_without_retry() {
    let store = Arc::new(InMemoryJobStore::new());
    let orphan = JobRecord::with_id(
        JobId::new(),
        JobKind::Video,
        owner(),
        JobPayload::prompt("kind no longer served"),
        3,
        Utc::now(),
    );
    store.put(orphan.clone()).await.unwrap();

    let backends = BackendRegistry::new().register(JobKind::Text, ScriptedBackend::succeeding());
    let runner = Runner::new(
        store,
        backends,
        RunnerConfig::default().with_retry(fast_retry(5)),
    );

    assert_eq!(runner.resume_pending().await.unwrap(), 1);

    let job = wait_for_status(&runner, orphan.id, JobStatus::Failed, WAIT).await;
    assert_eq!(job.attempt, 1);
    assert!(job
        .last_error
        .as_deref()
        .unwrap()
        .contains("no execution backend"));

    // No retry timer was armed
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.get_job(&orphan.id).await.unwrap().attempt, 1);
}

#[tokio::test]
async fn test_store_failure_surfaces_from_submit() {
    let backend = ScriptedBackend::succeeding();
    let backends = BackendRegistry::new().register(JobKind::Text, backend.clone());
    let runner = Runner::new(
        Arc::new(FailingStore),
        backends,
        RunnerConfig::default().with_retry(fast_retry(5)),
    );

    let result = runner
        .submit(JobKind::Text, owner(), JobPayload::prompt("lost write"), None)
        .await;
    assert!(matches!(result, Err(EngineError::Store(_))));
    assert!(matches!(runner.stats().await, Err(EngineError::Store(_))));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_shutdown_rejects_submissions_and_abandons_backoff() {
    let backend = ScriptedBackend::always_failing();
    let runner = test_runner(backend.clone(), 200);

    let id = submit_text(&runner, 3).await;
    let backing_off = wait_for(
        || {
            let runner = runner.clone();
            let backend = backend.clone();
            async move {
                let job = runner.get_job(&id).await.unwrap();
                backend.calls() == 1 && job.status == JobStatus::Queued
            }
        },
        WAIT,
        Duration::from_millis(2),
    )
    .await;
    assert!(backing_off);

    runner.shutdown();
    assert!(runner.shutdown_token().is_cancelled());

    let rejected = runner
        .submit(JobKind::Text, owner(), JobPayload::prompt("too late"), None)
        .await;
    assert!(matches!(rejected, Err(EngineError::ShuttingDown)));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let job = runner.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 1);
    assert_eq!(backend.calls(), 1);
}
