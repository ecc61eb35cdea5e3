// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process checkpoint store.

use super::CheckpointStore;
use crate::error::{BoxFuture, WatchError};
use crate::event::{CheckpointRecord, ResumeToken};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Checkpoint store held entirely in memory.
///
/// Clones share the same records, so a test can keep one handle for
/// assertions while the watch loop writes through another. `fail_next_saves`
/// injects store failures.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    records: Arc<RwLock<HashMap<ResumeToken, CheckpointRecord>>>,
    failing_saves: Arc<AtomicUsize>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail with a checkpoint error.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get_last(&self) -> BoxFuture<'_, Option<CheckpointRecord>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(records.values().max_by_key(|r| r.timestamp).cloned())
        })
    }

    fn save(&self, record: CheckpointRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.take_failure() {
                return Err(WatchError::checkpoint("save", "injected failure"));
            }
            self.records.write().await.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn delete(&self, token: &ResumeToken) -> BoxFuture<'_, ()> {
        let token = token.clone();
        Box::pin(async move {
            self.records.write().await.remove(&token);
            Ok(())
        })
    }

    fn count(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move { Ok(self.records.read().await.len() as u64) })
    }

    fn fetch_all(&self) -> BoxFuture<'_, Vec<CheckpointRecord>> {
        Box::pin(async move {
            let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
            all.sort_by_key(|r| r.timestamp);
            Ok(all)
        })
    }
}
