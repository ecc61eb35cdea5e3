//! Shared test utilities for integration and scenario tests.
//!
//! This module provides:
//! - MongoDB replica-set testcontainer setup
//! - A recording CollectionWatcher for asserting deliveries
//! - Helpers for spawning watches in the background

#![allow(dead_code)]

pub mod containers;
pub mod recording_watcher;

pub use containers::*;
pub use recording_watcher::*;

use change_watch::{CheckpointRecord, CheckpointStore, DispatchPipeline, Result, StreamManager};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Generous upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `manager.watch(None, pipeline)` on a background task.
pub fn spawn_watch(manager: &Arc<StreamManager>, pipeline: DispatchPipeline) -> JoinHandle<Result<()>> {
    let manager = Arc::clone(manager);
    tokio::spawn(async move { manager.watch(None, &pipeline).await })
}

/// Await a background watch, failing the test if it hangs.
pub async fn join_watch(handle: JoinHandle<Result<()>>) -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("watch did not finish in time")
        .expect("watch task panicked")
}

/// A small user document with a string `_id`.
pub fn user(n: usize) -> Value {
    json!({ "_id": format!("u{}", n), "n": n })
}

/// Every stored checkpoint.
pub async fn checkpoints(store: &dyn CheckpointStore) -> Vec<CheckpointRecord> {
    store.fetch_all().await.expect("fetch_all failed")
}
