// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document-level processing.
//!
//! Most consumers don't want change events, they want "a document was
//! inserted/updated/deleted". [`DocumentProcessor`] wires a source, a
//! checkpoint store, a [`StreamManager`] and a [`RetrySupervisor`] together
//! and hands each document to a [`CollectionWatcher`] as JSON bytes, so the
//! handler can deserialize into its own types.
//!
//! # Example
//!
//! ```rust,no_run
//! use change_watch::processor::{CollectionWatcher, DocumentProcessor, HandlerFuture};
//! use change_watch::{BackoffPolicy, ImageCaptureMode, MemoryChangeFeed, MemoryCheckpointStore};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl CollectionWatcher for Printer {
//!     fn insert(&self, doc: Vec<u8>) -> HandlerFuture<'_> {
//!         Box::pin(async move { println!("insert {}", String::from_utf8_lossy(&doc)); Ok(()) })
//!     }
//!     fn update(&self, doc: Vec<u8>) -> HandlerFuture<'_> {
//!         Box::pin(async move { println!("update {}", String::from_utf8_lossy(&doc)); Ok(()) })
//!     }
//!     fn delete(&self, doc: Vec<u8>) -> HandlerFuture<'_> {
//!         Box::pin(async move { println!("delete {}", String::from_utf8_lossy(&doc)); Ok(()) })
//!     }
//! }
//!
//! # async fn example() -> change_watch::Result<()> {
//! let processor = DocumentProcessor::new(
//!     Arc::new(MemoryChangeFeed::new("users")),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     ImageCaptureMode::UpdateLookup,
//!     BackoffPolicy::default(),
//! );
//! processor.start_with_retry(Arc::new(Printer)).await?;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{CheckpointStore, MongoCheckpointStore, SqliteCheckpointStore};
use crate::config::{CheckpointBackend, WatchConfig};
use crate::dispatch::{DispatchPipeline, DispatchStage};
use crate::error::{BoxFuture, Result, WatchError};
use crate::event::{ChangeEvent, OperationType};
use crate::manager::StreamManager;
use crate::source::{ChangeFeedSource, ImageCaptureMode, MongoChangeFeed};
use crate::supervisor::{BackoffPolicy, RetrySupervisor};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, trace};

/// Error returned by a [`CollectionWatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Boxed handler result.
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<(), HandlerError>> + Send + 'a>>;

/// Application-side handler for document changes.
///
/// Each method receives the document serialized as JSON.
pub trait CollectionWatcher: Send + Sync + 'static {
    fn insert(&self, document: Vec<u8>) -> HandlerFuture<'_>;
    fn update(&self, document: Vec<u8>) -> HandlerFuture<'_>;
    fn delete(&self, document: Vec<u8>) -> HandlerFuture<'_>;
}

/// Dispatch stage that routes events to a [`CollectionWatcher`].
pub struct DocumentDispatcher {
    watcher: Arc<dyn CollectionWatcher>,
}

impl DocumentDispatcher {
    pub fn new(watcher: Arc<dyn CollectionWatcher>) -> Self {
        Self { watcher }
    }

    /// JSON payload handed to the watcher for this event.
    ///
    /// Deletes prefer the pre-image, then the post-image. When no image is
    /// available the payload is `{"_id": <documentKey>}`.
    pub fn payload(event: &ChangeEvent) -> Result<Vec<u8>> {
        let bytes = match event.payload_document() {
            Some(document) => serde_json::to_vec(document)?,
            None => serde_json::to_vec(&serde_json::json!({ "_id": event.document_key }))?,
        };
        Ok(bytes)
    }

    async fn route(&self, event: &ChangeEvent) -> Result<()> {
        let operation = event.operation_type;
        let call = match operation {
            OperationType::Invalidate => return Ok(()),
            OperationType::Insert => self.watcher.insert(Self::payload(event)?),
            OperationType::Update => self.watcher.update(Self::payload(event)?),
            OperationType::Delete => self.watcher.delete(Self::payload(event)?),
        };
        trace!(token = %event.id, op = %operation, key = ?event.document_key, "Handing document to watcher");

        call.await.map_err(|e| WatchError::Handler {
            operation: operation.to_string(),
            message: e.0,
        })
    }
}

impl DispatchStage for DocumentDispatcher {
    fn dispatch<'a>(&'a self, event: &'a ChangeEvent, prior: Result<()>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            prior?;
            self.route(event).await
        })
    }
}

/// Watches one collection and feeds a [`CollectionWatcher`].
pub struct DocumentProcessor {
    manager: Arc<StreamManager>,
    supervisor: Arc<RetrySupervisor>,
}

impl DocumentProcessor {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        store: Arc<dyn CheckpointStore>,
        capture: ImageCaptureMode,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            manager: Arc::new(StreamManager::new(source, store).with_capture(capture)),
            supervisor: Arc::new(RetrySupervisor::new(policy)),
        }
    }

    /// Build a MongoDB-backed processor from configuration.
    ///
    /// `target_db` must be the database named in `config.target.database`.
    /// A Mongo checkpoint backend uses the same client.
    pub async fn from_config(config: &WatchConfig, target_db: &mongodb::Database) -> Result<Self> {
        config.validate()?;

        let source = MongoChangeFeed::from_database(target_db, &config.target.collection);
        let store: Arc<dyn CheckpointStore> = match &config.checkpoint.backend {
            CheckpointBackend::Sqlite { path } => {
                Arc::new(SqliteCheckpointStore::new(path, config.watch_id()).await?)
            }
            CheckpointBackend::Mongo { database } => {
                let local_db = target_db.client().database(database);
                Arc::new(MongoCheckpointStore::new(
                    &local_db,
                    &config.target.collection,
                    &config.checkpoint.suffix,
                ))
            }
        };

        info!(
            collection = %config.target.collection,
            watch_id = %config.watch_id(),
            capture = ?config.capture,
            "Document processor configured"
        );

        Ok(Self::new(
            Arc::new(source),
            store,
            config.capture,
            config.backoff.to_policy(),
        ))
    }

    pub fn manager(&self) -> &Arc<StreamManager> {
        &self.manager
    }

    pub fn supervisor(&self) -> &Arc<RetrySupervisor> {
        &self.supervisor
    }

    fn pipeline(watcher: Arc<dyn CollectionWatcher>) -> DispatchPipeline {
        DispatchPipeline::new().with_stage(DocumentDispatcher::new(watcher))
    }

    /// Single watch attempt, no retries.
    pub async fn start(&self, watcher: Arc<dyn CollectionWatcher>) -> Result<()> {
        self.manager.watch(None, &Self::pipeline(watcher)).await
    }

    /// Watch under the retry supervisor until stopped.
    pub async fn start_with_retry(&self, watcher: Arc<dyn CollectionWatcher>) -> Result<()> {
        self.supervisor
            .run(&self.manager, &Self::pipeline(watcher))
            .await
    }

    /// Stop supervising and cancel the active watch.
    pub fn stop(&self) {
        self.supervisor.shutdown();
        self.manager.cancel();
    }
}
