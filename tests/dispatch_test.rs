//! Claim ordering, concurrent claim safety, and worker-pool execution
//! semantics including failure isolation.

mod common;

use std::time::Duration;

use common::*;
use futures::future::join_all;
use medley_task_core::models::{priority, EntityRef, TaskType};
use medley_task_core::orchestration::{EnqueueRequest, TaskClaimer};
use medley_task_core::TaskStatus;
use uuid::Uuid;

#[tokio::test]
async fn higher_priority_claims_first_despite_age() {
    let (engine, _dir) = test_engine().await;

    // B is older but lower priority.
    let b = engine
        .enqueue(
            EnqueueRequest::new(TaskType::SyncArtist, EntityRef::for_id(1))
                .with_priority(priority::NORMAL),
        )
        .await
        .unwrap();
    let a = engine
        .enqueue(
            EnqueueRequest::new(TaskType::SyncArtist, EntityRef::for_id(2))
                .with_priority(priority::HIGH),
        )
        .await
        .unwrap();

    let claimer = TaskClaimer::new(engine.pool().clone(), Uuid::new_v4());
    let first = claimer.claim_next().await.unwrap().unwrap();
    let second = claimer.claim_next().await.unwrap().unwrap();

    assert_eq!(first.id, a.task.id);
    assert_eq!(second.id, b.task.id);
}

#[tokio::test]
async fn equal_priority_claims_oldest_first() {
    let (engine, _dir) = test_engine().await;

    let older = engine
        .enqueue(EnqueueRequest::new(TaskType::SyncAlbum, EntityRef::for_id(10)))
        .await
        .unwrap();
    let newer = engine
        .enqueue(EnqueueRequest::new(TaskType::SyncAlbum, EntityRef::for_id(11)))
        .await
        .unwrap();

    let claimer = TaskClaimer::new(engine.pool().clone(), Uuid::new_v4());
    assert_eq!(claimer.claim_next().await.unwrap().unwrap().id, older.task.id);
    assert_eq!(claimer.claim_next().await.unwrap().unwrap().id, newer.task.id);
}

#[tokio::test]
async fn claim_sets_started_at_and_running() {
    let (engine, _dir) = test_engine().await;

    let outcome = engine
        .enqueue(EnqueueRequest::new(TaskType::ScanLibrary, EntityRef::none()))
        .await
        .unwrap();

    let claimer = TaskClaimer::new(engine.pool().clone(), Uuid::new_v4());
    let claimed = claimer.claim_next().await.unwrap().unwrap();

    assert_eq!(claimed.id, outcome.task.id);
    assert_eq!(claimed.status, TaskStatus::Running);
    assert!(claimed.started_at.is_some());
    assert!(claimed.completed_at.is_none());
}

#[tokio::test]
async fn concurrent_claims_hand_out_each_task_once() {
    let (engine, _dir) = test_engine().await;

    let task_count = 3usize;
    let worker_count = 8usize;
    for i in 0..task_count {
        engine
            .enqueue(EnqueueRequest::new(
                TaskType::AnalyzeAudioQuality,
                EntityRef::for_id(i as i64),
            ))
            .await
            .unwrap();
    }

    let pool = engine.pool().clone();
    let claims = (0..worker_count).map(|_| {
        let claimer = TaskClaimer::new(pool.clone(), Uuid::new_v4());
        tokio::spawn(async move { claimer.claim_next().await.unwrap() })
    });

    let results: Vec<_> = join_all(claims)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let mut claimed_ids: Vec<i64> = results.iter().flatten().map(|task| task.id).collect();
    claimed_ids.sort_unstable();
    claimed_ids.dedup();

    assert_eq!(claimed_ids.len(), task_count);
    assert_eq!(
        results.iter().filter(|r| r.is_none()).count(),
        worker_count - task_count
    );
    assert_eq!(engine.get_statistics().await.unwrap().running, task_count as i64);
}

#[tokio::test]
async fn worker_pool_runs_enqueued_tasks() {
    let (engine, _dir) = test_engine().await;
    let handler = RecordingHandler::new(vec![TaskType::SyncArtist]);
    engine.registry().register(handler.clone());
    engine.start().unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let outcome = engine
            .enqueue(EnqueueRequest::new(TaskType::SyncArtist, EntityRef::for_id(i)))
            .await
            .unwrap();
        ids.push(outcome.task.id);
    }

    let stats = wait_for_stats(&engine, Duration::from_secs(5), |s| s.completed == 3).await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.running, 0);

    let mut executed = handler.executed.lock().clone();
    executed.sort_unstable();
    ids.sort_unstable();
    assert_eq!(executed, ids);

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn missing_handler_fails_the_task_immediately() {
    let (engine, _dir) = test_engine().await;
    engine.start().unwrap();

    let outcome = engine
        .enqueue(EnqueueRequest::new(TaskType::NpmBuild, EntityRef::none()))
        .await
        .unwrap();

    let task = wait_for_status(
        &engine,
        outcome.task.id,
        TaskStatus::Failed,
        Duration::from_secs(5),
    )
    .await;

    let message = task.error_message.unwrap();
    assert!(message.contains("No handler registered"), "{message}");
    assert!(message.contains("npm_build"), "{message}");

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn handler_error_becomes_failed_task_with_message() {
    let (engine, _dir) = test_engine().await;
    engine.registry().register(FailingHandler::new(
        vec![TaskType::DownloadAlbum],
        "download source unavailable",
    ));
    engine.start().unwrap();

    let outcome = engine
        .enqueue(EnqueueRequest::new(TaskType::DownloadAlbum, EntityRef::for_id(5)))
        .await
        .unwrap();

    let task = wait_for_status(
        &engine,
        outcome.task.id,
        TaskStatus::Failed,
        Duration::from_secs(5),
    )
    .await;
    assert!(task
        .error_message
        .unwrap()
        .contains("download source unavailable"));
    assert!(task.completed_at.is_some());

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn failure_then_manual_retry_reruns_the_work() {
    let (engine, _dir) = test_engine().await;
    let handler = FlakyHandler::new(vec![TaskType::DownloadAlbum], 1);
    engine.registry().register(handler.clone());
    engine.start().unwrap();

    let outcome = engine
        .enqueue(EnqueueRequest::new(TaskType::DownloadAlbum, EntityRef::for_id(5)))
        .await
        .unwrap();

    let failed = wait_for_status(
        &engine,
        outcome.task.id,
        TaskStatus::Failed,
        Duration::from_secs(5),
    )
    .await;
    assert!(failed.error_message.is_some());

    let successor = engine.retry(failed.id).await.unwrap();
    assert_ne!(successor.id, failed.id);

    wait_for_status(&engine, successor.id, TaskStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(handler.attempts(), 2);

    // The original attempt's record is untouched.
    let original = engine.get_task(failed.id).await.unwrap();
    assert_eq!(original.status, TaskStatus::Failed);

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn panicking_handler_does_not_take_down_the_pool() {
    let (engine, _dir) = test_engine().await;
    engine
        .registry()
        .register(PanickingHandler::new(vec![TaskType::CacheClear]));
    let recorder = RecordingHandler::new(vec![TaskType::SyncArtist]);
    engine.registry().register(recorder.clone());
    engine.start().unwrap();

    let doomed = engine
        .enqueue(EnqueueRequest::new(TaskType::CacheClear, EntityRef::none()))
        .await
        .unwrap();
    let healthy = engine
        .enqueue(EnqueueRequest::new(TaskType::SyncArtist, EntityRef::for_id(1)))
        .await
        .unwrap();

    let crashed = wait_for_status(
        &engine,
        doomed.task.id,
        TaskStatus::Failed,
        Duration::from_secs(5),
    )
    .await;
    assert!(crashed.error_message.unwrap().contains("panicked"));

    wait_for_status(&engine, healthy.task.id, TaskStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(recorder.executed.lock().len(), 1);

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn crashed_tasks_requeue_up_to_the_configured_limit() {
    let mut config = test_config();
    config.max_auto_requeues = 1;
    let (engine, _dir) = test_engine_with_config(config).await;
    engine.registry().register(FailingHandler::new(
        vec![TaskType::ProcessLibraryFile],
        "corrupt file",
    ));
    engine.start().unwrap();

    engine
        .enqueue(EnqueueRequest::new(
            TaskType::ProcessLibraryFile,
            EntityRef::for_id(42),
        ))
        .await
        .unwrap();

    // Original failure plus exactly one automatic successor.
    let stats = wait_for_stats(&engine, Duration::from_secs(5), |s| s.failed == 2).await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.running, 0);

    // Give the pool a moment to prove no third attempt appears.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.get_statistics().await.unwrap().failed, 2);

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cancel_during_execution_wins_over_completion() {
    let (engine, _dir) = test_engine().await;
    let gate = GateHandler::new(vec![TaskType::AnalyzeExistingTracks]);
    engine.registry().register(gate.clone());
    engine.start().unwrap();

    let outcome = engine
        .enqueue(EnqueueRequest::new(
            TaskType::AnalyzeExistingTracks,
            EntityRef::none(),
        ))
        .await
        .unwrap();
    let task_id = outcome.task.id;

    wait_for_status(&engine, task_id, TaskStatus::Running, Duration::from_secs(5)).await;

    engine.cancel(task_id, "user requested").await.unwrap();
    let cancelled = engine.get_task(task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    let completed_at = cancelled.completed_at.unwrap();

    // Let the blocked handler finish; its completion must lose the race.
    gate.release();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = engine.get_task(task_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Cancelled);
    assert_eq!(after.completed_at.unwrap(), completed_at);
    assert_eq!(after.error_message.as_deref(), Some("user requested"));

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn single_worker_deployment_is_correct() {
    let mut config = test_config();
    config.worker_count = 1;
    let (engine, _dir) = test_engine_with_config(config).await;
    let handler = RecordingHandler::new(vec![TaskType::SyncAlbum]);
    engine.registry().register(handler.clone());
    engine.start().unwrap();

    for i in 0..4 {
        engine
            .enqueue(EnqueueRequest::new(TaskType::SyncAlbum, EntityRef::for_id(i)))
            .await
            .unwrap();
    }

    wait_for_stats(&engine, Duration::from_secs(5), |s| s.completed == 4).await;
    assert_eq!(handler.executed.lock().len(), 4);

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn blocked_worker_does_not_starve_the_pool() {
    let (engine, _dir) = test_engine().await;
    let gate = GateHandler::new(vec![TaskType::SyncAllArtists]);
    engine.registry().register(gate.clone());
    let recorder = RecordingHandler::new(vec![TaskType::SyncArtist]);
    engine.registry().register(recorder.clone());
    engine.start().unwrap();

    // Occupies one of the two workers indefinitely.
    let blocked = engine
        .enqueue(EnqueueRequest::new(TaskType::SyncAllArtists, EntityRef::none()))
        .await
        .unwrap();
    wait_for_status(&engine, blocked.task.id, TaskStatus::Running, Duration::from_secs(5)).await;

    let quick = engine
        .enqueue(EnqueueRequest::new(TaskType::SyncArtist, EntityRef::for_id(9)))
        .await
        .unwrap();
    wait_for_status(&engine, quick.task.id, TaskStatus::Completed, Duration::from_secs(5)).await;

    gate.release();
    wait_for_status(&engine, blocked.task.id, TaskStatus::Completed, Duration::from_secs(5)).await;

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn type_filtered_claimer_skips_other_kinds() {
    let (engine, _dir) = test_engine().await;

    engine
        .enqueue(EnqueueRequest::new(TaskType::SyncArtist, EntityRef::for_id(1)))
        .await
        .unwrap();
    let wanted = engine
        .enqueue(EnqueueRequest::new(TaskType::RenameFiles, EntityRef::for_id(2)))
        .await
        .unwrap();

    let claimer = TaskClaimer::new(engine.pool().clone(), Uuid::new_v4())
        .with_type_filter(TaskType::RenameFiles);
    let claimed = claimer.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, wanted.task.id);
    assert!(claimer.claim_next().await.unwrap().is_none());
}
