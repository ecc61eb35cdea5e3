// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recording CollectionWatcher for testing.
//!
//! Records every successful insert/update/delete call for assertions and can
//! be told to fail once on a given document `_id`.

use change_watch::{CollectionWatcher, HandlerError, HandlerFuture};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::watch;

/// A recorded handler call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub operation: &'static str,
    pub document: Value,
}

impl Call {
    /// The document's `_id` as a string.
    pub fn id(&self) -> String {
        match self.document.get("_id") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// CollectionWatcher that records calls.
///
/// # Example
/// ```rust,ignore
/// let watcher = Arc::new(RecordingWatcher::new());
/// watcher.fail_once_on("u3");
///
/// // Use in tests...
///
/// watcher.wait_for(5).await;
/// assert_eq!(watcher.ids(), vec!["u1", "u2", "u3", "u4", "u5"]);
/// ```
pub struct RecordingWatcher {
    calls: Mutex<Vec<Call>>,
    fail_once: Mutex<HashSet<String>>,
    failures: Mutex<Vec<Call>>,
    count_tx: watch::Sender<usize>,
}

impl Default for RecordingWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingWatcher {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            calls: Mutex::new(Vec::new()),
            fail_once: Mutex::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
            count_tx,
        }
    }

    /// The next call for a document with this `_id` fails.
    pub fn fail_once_on(&self, id: &str) {
        self.fail_once.lock().unwrap().insert(id.to_string());
    }

    /// Successful calls, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// `_id`s of successful calls, in order.
    pub fn ids(&self) -> Vec<String> {
        self.calls().iter().map(Call::id).collect()
    }

    /// Calls that were made to fail.
    pub fn failures(&self) -> Vec<Call> {
        self.failures.lock().unwrap().clone()
    }

    /// Wait until at least `n` calls have succeeded.
    pub async fn wait_for(&self, n: usize) {
        let mut rx = self.count_tx.subscribe();
        let reached = tokio::time::timeout(super::TEST_TIMEOUT, rx.wait_for(|count| *count >= n))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        assert!(
            reached,
            "timed out waiting for {} calls, saw {:?}",
            n,
            self.ids()
        );
    }

    fn record(&self, operation: &'static str, document: Vec<u8>) -> HandlerFuture<'_> {
        let result = match serde_json::from_slice::<Value>(&document) {
            Ok(document) => {
                let call = Call { operation, document };
                if self.fail_once.lock().unwrap().remove(&call.id()) {
                    self.failures.lock().unwrap().push(call);
                    Err(HandlerError::new("injected handler failure"))
                } else {
                    let count = {
                        let mut calls = self.calls.lock().unwrap();
                        calls.push(call);
                        calls.len()
                    };
                    self.count_tx.send_replace(count);
                    Ok(())
                }
            }
            Err(e) => Err(HandlerError::new(e.to_string())),
        };
        Box::pin(async move { result })
    }
}

impl CollectionWatcher for RecordingWatcher {
    fn insert(&self, document: Vec<u8>) -> HandlerFuture<'_> {
        self.record("insert", document)
    }

    fn update(&self, document: Vec<u8>) -> HandlerFuture<'_> {
        self.record("update", document)
    }

    fn delete(&self, document: Vec<u8>) -> HandlerFuture<'_> {
        self.record("delete", document)
    }
}
