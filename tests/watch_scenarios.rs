// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end watch scenarios against the in-memory feed.
//!
//! These run without Docker: `MemoryChangeFeed` reproduces MongoDB resume
//! semantics, so the whole manager/supervisor/checkpoint path is exercised.
//!
//! # Running Tests
//! ```bash
//! cargo test --test watch_scenarios
//! ```
//!
//! # Test Organization
//! - `scenario_*` - cold start, warm restart, handler failure, invalidate
//! - `resume_*` - checkpoint-driven resume positions
//! - `capture_*` - pre-image capture and fallback
//! - `supervisor_*` - retry and shutdown behaviour
//! - `sqlite_*` - durable checkpoints across process restarts

mod common;

use change_watch::{
    stage_fn, BackoffPolicy, ChangeEvent, CheckpointStore, DispatchPipeline, DocumentProcessor,
    ImageCaptureMode, MemoryChangeFeed, MemoryCheckpointStore, OperationType, SqliteCheckpointStore,
    StartPosition, StreamManager, WatchError,
};
use common::{checkpoints, join_watch, spawn_watch, user, RecordingWatcher};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

fn processor(
    feed: &MemoryChangeFeed,
    store: Arc<dyn CheckpointStore>,
    capture: ImageCaptureMode,
) -> Arc<DocumentProcessor> {
    Arc::new(DocumentProcessor::new(
        Arc::new(feed.clone()),
        store,
        capture,
        BackoffPolicy::testing(),
    ))
}

fn start(
    processor: &Arc<DocumentProcessor>,
    watcher: &Arc<RecordingWatcher>,
) -> JoinHandle<change_watch::Result<()>> {
    let processor = Arc::clone(processor);
    let watcher = Arc::clone(watcher);
    tokio::spawn(async move { processor.start(watcher).await })
}

fn start_with_retry(
    processor: &Arc<DocumentProcessor>,
    watcher: &Arc<RecordingWatcher>,
) -> JoinHandle<change_watch::Result<()>> {
    let processor = Arc::clone(processor);
    let watcher = Arc::clone(watcher);
    tokio::spawn(async move { processor.start_with_retry(watcher).await })
}

fn ids(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|n| format!("u{}", n)).collect()
}

/// Cold start, five inserts, clean stop.
async fn run_first_five(feed: &MemoryChangeFeed, store: Arc<dyn CheckpointStore>) -> Arc<RecordingWatcher> {
    let processor = processor(feed, store, ImageCaptureMode::UpdateLookup);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start(&processor, &watcher);

    feed.wait_for_opens(feed.opens().await.len() + 1).await;
    for n in 1..=5 {
        feed.insert(user(n)).await;
    }
    watcher.wait_for(5).await;

    processor.stop();
    join_watch(handle).await.unwrap();
    watcher
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_a_cold_start_delivers_inserts_in_order() {
    let feed = MemoryChangeFeed::new("users");
    let store = MemoryCheckpointStore::new();

    let watcher = run_first_five(&feed, Arc::new(store.clone())).await;

    assert_eq!(watcher.ids(), ids(1..=5));
    assert!(watcher.calls().iter().all(|c| c.operation == "insert"));
    assert_eq!(watcher.calls()[0].document, json!({"_id": "u1", "n": 1}));

    let remaining = checkpoints(&store).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, feed.events().await[4].id);
    assert!(remaining[0].delivered);
    assert_eq!(feed.opens().await[0].position, StartPosition::Now);
}

#[tokio::test]
async fn scenario_b_restart_delivers_only_new_documents() {
    let feed = MemoryChangeFeed::new("users");
    let store = MemoryCheckpointStore::new();
    run_first_five(&feed, Arc::new(store.clone())).await;

    // Written while nobody is watching
    for n in 6..=10 {
        feed.insert(user(n)).await;
    }

    let processor = processor(&feed, Arc::new(store.clone()), ImageCaptureMode::UpdateLookup);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start(&processor, &watcher);
    watcher.wait_for(5).await;
    processor.stop();
    join_watch(handle).await.unwrap();

    assert_eq!(watcher.ids(), ids(6..=10));

    let events = feed.events().await;
    let remaining = checkpoints(&store).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, events[9].id);
    assert_eq!(
        feed.opens().await[1].position,
        StartPosition::StartAtOperationTime(events[4].timestamp)
    );
}

#[tokio::test]
async fn scenario_c_handler_failure_redelivers_on_restart() {
    let feed = MemoryChangeFeed::new("users");
    let store = MemoryCheckpointStore::new();
    let watcher = Arc::new(RecordingWatcher::new());
    watcher.fail_once_on("u3");

    let first = processor(&feed, Arc::new(store.clone()), ImageCaptureMode::UpdateLookup);
    let handle = start(&first, &watcher);
    feed.wait_for_opens(1).await;
    for n in 1..=5 {
        feed.insert(user(n)).await;
    }

    let err = join_watch(handle).await.unwrap_err();
    match &err {
        WatchError::Handler { operation, message } => {
            assert_eq!(operation, "insert");
            assert_eq!(message, "injected handler failure");
        }
        other => panic!("expected handler error, got {other}"),
    }
    assert_eq!(watcher.ids(), ids(1..=2));
    assert_eq!(watcher.failures().len(), 1);

    let events = feed.events().await;
    let remaining = checkpoints(&store).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, events[2].id);
    assert!(!remaining[0].delivered);

    let second = processor(&feed, Arc::new(store.clone()), ImageCaptureMode::UpdateLookup);
    let handle = start(&second, &watcher);
    watcher.wait_for(5).await;
    second.stop();
    join_watch(handle).await.unwrap();

    assert_eq!(watcher.ids(), ids(1..=5));
    assert_eq!(checkpoints(&store).await[0].id, events[4].id);
}

#[tokio::test]
async fn scenario_d_invalidate_restarts_after_invalidate_token() {
    let feed = MemoryChangeFeed::new("users");
    let store = MemoryCheckpointStore::new();
    let processor = processor(&feed, Arc::new(store.clone()), ImageCaptureMode::UpdateLookup);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start_with_retry(&processor, &watcher);

    feed.wait_for_opens(1).await;
    feed.insert(user(1)).await;
    feed.insert(user(2)).await;
    watcher.wait_for(2).await;

    let invalidate = feed.invalidate().await;
    feed.insert(user(3)).await;

    feed.wait_for_opens(2).await;
    watcher.wait_for(3).await;
    processor.stop();
    join_watch(handle).await.unwrap();

    assert_eq!(watcher.ids(), ids(1..=3));
    assert_eq!(
        feed.opens().await[1].position,
        StartPosition::StartAfter(invalidate.clone())
    );

    let remaining = checkpoints(&store).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, feed.events().await[3].id);
    assert_ne!(remaining[0].id, invalidate);
}

// =============================================================================
// Resume
// =============================================================================

#[tokio::test]
async fn resume_after_manual_invalidate_checkpoint() {
    let feed = MemoryChangeFeed::new("users");
    let store = MemoryCheckpointStore::new();
    let manager = Arc::new(StreamManager::new(Arc::new(feed.clone()), Arc::new(store.clone())));

    // A single attempt, no supervisor: the invalidate surfaces to the caller
    let handle = spawn_watch(&manager, DispatchPipeline::new());
    feed.wait_for_opens(1).await;
    feed.insert(user(1)).await;
    let invalidate = feed.invalidate().await;

    let err = join_watch(handle).await.unwrap_err();
    assert!(err.is_invalidate());
    assert_eq!(checkpoints(&store).await[0].operation_type, OperationType::Invalidate);
    assert!(!manager.is_watching());

    feed.insert(user(2)).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let pipeline = DispatchPipeline::new().with_stage(stage_fn(move |event: ChangeEvent, prior| {
        sink.lock().unwrap().push(event.document_key.clone());
        async move { prior }
    }));
    let handle = spawn_watch(&manager, pipeline);
    feed.wait_for_opens(2).await;

    assert_eq!(feed.opens().await[1].position, StartPosition::StartAfter(invalidate));
    tokio::time::timeout(common::TEST_TIMEOUT, async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    manager.stop();
    join_watch(handle).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some("u2".to_string())]);
    assert_eq!(checkpoints(&store).await.len(), 1);
}

#[tokio::test]
async fn resume_handlers_observe_increasing_timestamps() {
    let feed = MemoryChangeFeed::new("users");
    let manager = Arc::new(StreamManager::new(
        Arc::new(feed.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    ));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let pipeline = DispatchPipeline::new().with_stage(stage_fn(move |event: ChangeEvent, prior| {
        sink.lock().unwrap().push(event.timestamp);
        async move { prior }
    }));

    let handle = spawn_watch(&manager, pipeline);
    feed.wait_for_opens(1).await;
    for n in 1..=4 {
        feed.insert(user(n)).await;
    }
    let mut fields = serde_json::Map::new();
    fields.insert("n".into(), json!(20));
    feed.update("u2", fields).await;
    feed.delete("u3").await;

    tokio::time::timeout(common::TEST_TIMEOUT, async {
        while seen.lock().unwrap().len() < 6 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    manager.stop();
    join_watch(handle).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

// =============================================================================
// Capture
// =============================================================================

#[tokio::test]
async fn capture_required_delivers_pre_image_on_delete() {
    let feed = MemoryChangeFeed::new("users");
    let processor = processor(&feed, Arc::new(MemoryCheckpointStore::new()), ImageCaptureMode::Required);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start(&processor, &watcher);

    feed.wait_for_opens(1).await;
    feed.insert(json!({"_id": "u1", "name": "ada"})).await;
    feed.delete("u1").await;
    watcher.wait_for(2).await;
    processor.stop();
    join_watch(handle).await.unwrap();

    let calls = watcher.calls();
    assert_eq!(calls[1].operation, "delete");
    assert_eq!(calls[1].document, json!({"_id": "u1", "name": "ada"}));
}

#[tokio::test]
async fn capture_falls_back_when_pre_images_expired() {
    let feed = MemoryChangeFeed::new("users");
    feed.expire_pre_images(true);
    let processor = processor(&feed, Arc::new(MemoryCheckpointStore::new()), ImageCaptureMode::Required);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start(&processor, &watcher);

    feed.wait_for_opens(1).await;
    assert_eq!(feed.open_attempts(), 2);
    assert_eq!(feed.opens().await[0].capture, ImageCaptureMode::UpdateLookup);

    feed.insert(json!({"_id": "u1", "name": "ada"})).await;
    feed.delete("u1").await;
    watcher.wait_for(2).await;
    processor.stop();
    join_watch(handle).await.unwrap();

    // No pre-image: the delete carries only the key
    assert_eq!(watcher.calls()[1].document, json!({"_id": "u1"}));
}

#[tokio::test]
async fn capture_off_strips_update_post_image() {
    let feed = MemoryChangeFeed::new("users");
    let processor = processor(&feed, Arc::new(MemoryCheckpointStore::new()), ImageCaptureMode::Off);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start(&processor, &watcher);

    feed.wait_for_opens(1).await;
    feed.insert(json!({"_id": "u1", "name": "ada"})).await;
    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), json!("grace"));
    feed.update("u1", fields).await;
    watcher.wait_for(2).await;
    processor.stop();
    join_watch(handle).await.unwrap();

    assert_eq!(watcher.calls()[1].operation, "update");
    assert_eq!(watcher.calls()[1].document, json!({"_id": "u1"}));
}

// =============================================================================
// Manager and supervisor
// =============================================================================

#[tokio::test]
async fn supervisor_stop_when_idle_is_noop() {
    let feed = MemoryChangeFeed::new("users");
    let processor = processor(&feed, Arc::new(MemoryCheckpointStore::new()), ImageCaptureMode::UpdateLookup);

    processor.stop();
    processor.manager().stop();
    assert!(!processor.manager().is_watching());
    assert_eq!(feed.open_attempts(), 0);
}

#[tokio::test]
async fn supervisor_rejects_concurrent_watch() {
    let feed = MemoryChangeFeed::new("users");
    let processor = processor(&feed, Arc::new(MemoryCheckpointStore::new()), ImageCaptureMode::UpdateLookup);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start(&processor, &watcher);
    feed.wait_for_opens(1).await;

    let err = processor.start(watcher.clone()).await.unwrap_err();
    assert!(matches!(err, WatchError::InvalidState { .. }));
    assert_eq!(feed.open_attempts(), 1);

    processor.stop();
    join_watch(handle).await.unwrap();
}

#[tokio::test]
async fn supervisor_restarts_after_stop() {
    let feed = MemoryChangeFeed::new("users");
    let processor = processor(&feed, Arc::new(MemoryCheckpointStore::new()), ImageCaptureMode::UpdateLookup);
    let watcher = Arc::new(RecordingWatcher::new());

    let handle = start_with_retry(&processor, &watcher);
    feed.wait_for_opens(1).await;
    feed.insert(user(1)).await;
    watcher.wait_for(1).await;
    processor.stop();
    join_watch(handle).await.unwrap();

    let handle = start_with_retry(&processor, &watcher);
    feed.wait_for_opens(2).await;
    feed.insert(user(2)).await;
    watcher.wait_for(2).await;
    processor.stop();
    join_watch(handle).await.unwrap();

    assert_eq!(watcher.ids(), ids(1..=2));
    assert_eq!(feed.open_attempts(), 2);
}

#[tokio::test]
async fn supervisor_retries_transient_open_failures() {
    let feed = MemoryChangeFeed::new("users");
    feed.fail_next_opens(2);
    let processor = processor(&feed, Arc::new(MemoryCheckpointStore::new()), ImageCaptureMode::UpdateLookup);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start_with_retry(&processor, &watcher);

    feed.wait_for_opens(1).await;
    assert_eq!(feed.open_attempts(), 3);
    feed.insert(user(1)).await;
    watcher.wait_for(1).await;

    processor.stop();
    join_watch(handle).await.unwrap();
    assert!(!processor.manager().is_watching());
}

#[tokio::test]
async fn supervisor_gives_up_with_last_error() {
    let feed = MemoryChangeFeed::new("users");
    feed.fail_next_opens(100);
    let processor = processor(&feed, Arc::new(MemoryCheckpointStore::new()), ImageCaptureMode::UpdateLookup);
    let watcher = Arc::new(RecordingWatcher::new());

    let err = join_watch(start_with_retry(&processor, &watcher)).await.unwrap_err();
    assert_eq!(err.kind(), "source");
    assert_eq!(feed.open_attempts(), 3);
    assert!(watcher.calls().is_empty());
}

#[tokio::test]
async fn supervisor_shutdown_interrupts_backoff() {
    let feed = MemoryChangeFeed::new("users");
    feed.fail_next_opens(100);
    let processor = Arc::new(DocumentProcessor::new(
        Arc::new(feed.clone()),
        Arc::new(MemoryCheckpointStore::new()),
        ImageCaptureMode::UpdateLookup,
        BackoffPolicy {
            initial_interval: std::time::Duration::from_secs(3600),
            ..BackoffPolicy::default()
        },
    ));
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start_with_retry(&processor, &watcher);

    while feed.open_attempts() == 0 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    processor.stop();
    join_watch(handle).await.unwrap();
    assert_eq!(feed.open_attempts(), 1);
}

// =============================================================================
// SQLite durability
// =============================================================================

#[tokio::test]
async fn sqlite_checkpoint_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let feed = MemoryChangeFeed::new("users");

    let store = SqliteCheckpointStore::new(&path, "app.users").await.unwrap();
    run_first_five(&feed, Arc::new(store.clone())).await;
    store.close().await;

    feed.insert(user(6)).await;
    feed.insert(user(7)).await;

    let reopened = SqliteCheckpointStore::new(&path, "app.users").await.unwrap();
    let last = reopened.get_last().await.unwrap().unwrap();
    assert_eq!(last.id, feed.events().await[4].id);
    assert!(last.delivered);

    let processor = processor(&feed, Arc::new(reopened.clone()), ImageCaptureMode::UpdateLookup);
    let watcher = Arc::new(RecordingWatcher::new());
    let handle = start(&processor, &watcher);
    watcher.wait_for(2).await;
    processor.stop();
    join_watch(handle).await.unwrap();

    assert_eq!(watcher.ids(), ids(6..=7));
    assert_eq!(reopened.count().await.unwrap(), 1);
    reopened.close().await;
}
