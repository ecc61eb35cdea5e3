// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process change feed.
//!
//! An append-only event log with the same resume semantics as a MongoDB
//! change stream:
//!
//! - `Now` starts after the current tail
//! - `StartAfter(token)` starts strictly after that event
//! - `StartAtOperationTime(ts)` starts at the first event with `timestamp >= ts`
//! - a cursor ends right after yielding an `invalidate`
//!
//! Mutations go through [`insert`](MemoryChangeFeed::insert),
//! [`update`](MemoryChangeFeed::update), [`delete`](MemoryChangeFeed::delete)
//! and [`invalidate`](MemoryChangeFeed::invalidate), which keep a current
//! document per key so update/delete events can carry pre-images.
//!
//! Fault injection: [`fail_next_opens`](MemoryChangeFeed::fail_next_opens)
//! and [`expire_pre_images`](MemoryChangeFeed::expire_pre_images).

use super::{ChangeFeedSource, EventCursor, ImageCaptureMode, OpenRequest, StartPosition};
use crate::error::{BoxFuture, Result, WatchError};
use crate::event::{ChangeEvent, OperationType, ResumeToken, Timestamp, UpdateDescription};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::trace;

/// Logical seconds shared by every event; ordering comes from the increment.
const BASE_TIME: u32 = 1_700_000_000;

struct Inner {
    name: String,
    database: String,
    log: RwLock<Vec<ChangeEvent>>,
    documents: Mutex<HashMap<String, Value>>,
    len_tx: watch::Sender<usize>,
    opens: Mutex<Vec<OpenRequest>>,
    opens_tx: watch::Sender<usize>,
    open_attempts: AtomicUsize,
    failing_opens: AtomicUsize,
    pre_images_expired: AtomicBool,
}

/// In-memory [`ChangeFeedSource`]. Clones share the same log.
#[derive(Clone)]
pub struct MemoryChangeFeed {
    inner: Arc<Inner>,
}

fn render_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn shape(mut event: ChangeEvent, capture: ImageCaptureMode) -> ChangeEvent {
    if !capture.includes_pre_images() {
        event.full_document_before_change = None;
    }
    if !capture.includes_update_lookup() && event.operation_type == OperationType::Update {
        event.full_document = None;
    }
    event
}

struct CursorState {
    inner: Arc<Inner>,
    index: usize,
    len_rx: watch::Receiver<usize>,
    capture: ImageCaptureMode,
    done: bool,
}

impl MemoryChangeFeed {
    pub fn new(collection: impl Into<String>) -> Self {
        let (len_tx, _) = watch::channel(0);
        let (opens_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name: collection.into(),
                database: "memory".to_string(),
                log: RwLock::new(Vec::new()),
                documents: Mutex::new(HashMap::new()),
                len_tx,
                opens: Mutex::new(Vec::new()),
                opens_tx,
                open_attempts: AtomicUsize::new(0),
                failing_opens: AtomicUsize::new(0),
                pre_images_expired: AtomicBool::new(false),
            }),
        }
    }

    async fn append(
        &self,
        operation_type: OperationType,
        document_key: Option<String>,
        full_document: Option<Value>,
        before: Option<Value>,
        update_description: Option<UpdateDescription>,
    ) -> ResumeToken {
        let mut log = self.inner.log.write().await;
        let seq = log.len() as u32 + 1;
        let token = ResumeToken::new(format!("{:016x}", seq));
        log.push(ChangeEvent {
            id: token.clone(),
            operation_type,
            timestamp: Timestamp::new(BASE_TIME, seq),
            database: Some(self.inner.database.clone()),
            collection: Some(self.inner.name.clone()),
            document_key,
            full_document,
            full_document_before_change: before,
            update_description,
        });
        let len = log.len();
        drop(log);

        self.inner.len_tx.send_replace(len);
        trace!(collection = %self.inner.name, token = %token, op = %operation_type, "Appended event");
        token
    }

    /// Record an insert. `document` should carry an `_id`.
    pub async fn insert(&self, document: Value) -> ResumeToken {
        let key = document.get("_id").map(render_key);
        if let Some(k) = &key {
            self.inner
                .documents
                .lock()
                .await
                .insert(k.clone(), document.clone());
        }
        self.append(OperationType::Insert, key, Some(document), None, None)
            .await
    }

    /// Record an update setting `fields` on the document with this key.
    pub async fn update(&self, key: &str, fields: Map<String, Value>) -> ResumeToken {
        let (before, after) = {
            let mut documents = self.inner.documents.lock().await;
            let before = documents.get(key).cloned();
            let mut after = before
                .clone()
                .unwrap_or_else(|| serde_json::json!({ "_id": key }));
            if let Value::Object(map) = &mut after {
                for (k, v) in &fields {
                    map.insert(k.clone(), v.clone());
                }
            }
            documents.insert(key.to_string(), after.clone());
            (before, after)
        };
        let description = UpdateDescription {
            updated_fields: fields,
            removed_fields: Vec::new(),
        };
        self.append(
            OperationType::Update,
            Some(key.to_string()),
            Some(after),
            before,
            Some(description),
        )
        .await
    }

    /// Record a delete of the document with this key.
    pub async fn delete(&self, key: &str) -> ResumeToken {
        let before = self.inner.documents.lock().await.remove(key);
        self.append(OperationType::Delete, Some(key.to_string()), None, before, None)
            .await
    }

    /// Record an invalidate (collection dropped or renamed).
    pub async fn invalidate(&self) -> ResumeToken {
        self.inner.documents.lock().await.clear();
        self.append(OperationType::Invalidate, None, None, None, None)
            .await
    }

    /// Snapshot of every event appended so far.
    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.inner.log.read().await.clone()
    }

    /// Make the next `n` opens fail with a source error.
    pub fn fail_next_opens(&self, n: usize) {
        self.inner.failing_opens.store(n, Ordering::SeqCst);
    }

    /// While set, opens that require pre-images are rejected.
    pub fn expire_pre_images(&self, expired: bool) {
        self.inner.pre_images_expired.store(expired, Ordering::SeqCst);
    }

    /// Successful opens, in order.
    pub async fn opens(&self) -> Vec<OpenRequest> {
        self.inner.opens.lock().await.clone()
    }

    /// Every open call, including the failed ones.
    pub fn open_attempts(&self) -> usize {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` cursors have been opened successfully.
    pub async fn wait_for_opens(&self, n: usize) {
        let mut rx = self.inner.opens_tx.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    fn take_open_failure(&self) -> bool {
        self.inner
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn resolve_start(&self, position: &StartPosition) -> Result<usize> {
        let log = self.inner.log.read().await;
        match position {
            StartPosition::Now => Ok(log.len()),
            StartPosition::StartAfter(token) => log
                .iter()
                .position(|e| &e.id == token)
                .map(|i| i + 1)
                .ok_or_else(|| {
                    WatchError::feed_msg("open", format!("resume token {} not found in history", token))
                }),
            StartPosition::StartAtOperationTime(ts) => Ok(log
                .iter()
                .position(|e| e.timestamp >= *ts)
                .unwrap_or(log.len())),
        }
    }

    async fn open_cursor(&self, request: OpenRequest) -> Result<EventCursor> {
        self.inner.open_attempts.fetch_add(1, Ordering::SeqCst);

        if self.take_open_failure() {
            return Err(WatchError::feed_msg("open", "injected open failure"));
        }
        if request.capture.includes_pre_images()
            && self.inner.pre_images_expired.load(Ordering::SeqCst)
        {
            return Err(WatchError::PreImageUnavailable(
                "NoMatchingDocument: pre-image history expired".to_string(),
            ));
        }

        let index = self.resolve_start(&request.position).await?;
        let state = CursorState {
            inner: Arc::clone(&self.inner),
            index,
            len_rx: self.inner.len_tx.subscribe(),
            capture: request.capture,
            done: false,
        };

        {
            let mut opens = self.inner.opens.lock().await;
            opens.push(request);
            self.inner.opens_tx.send_replace(opens.len());
        }

        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                let len = *st.len_rx.borrow_and_update();
                if st.index < len {
                    let event = st.inner.log.read().await[st.index].clone();
                    st.index += 1;
                    st.done = event.is_invalidate();
                    return Some((Ok(shape(event, st.capture)), st));
                }
                if st.len_rx.changed().await.is_err() {
                    return None;
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

impl ChangeFeedSource for MemoryChangeFeed {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, EventCursor> {
        Box::pin(self.open_cursor(request))
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}
