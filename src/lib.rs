//! # Change Watch
//!
//! A durable MongoDB change-stream consumer that delivers every mutation on a
//! collection to application handlers, exactly once in effect, across crashes,
//! network drops and collection drops/renames.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              change-watch                                 │
//! │                                                                           │
//! │  ┌─────────────────┐   ┌───────────────┐   ┌─────────────────────────┐   │
//! │  │ RetrySupervisor │──►│ StreamManager │──►│ ChangeFeedSource (open) │   │
//! │  │ (backoff)       │   │ (one watch)   │   │ Mongo / Memory          │   │
//! │  └─────────────────┘   └───────────────┘   └─────────────────────────┘   │
//! │          ▲                     │                        │                 │
//! │          │ Invalidate          ▼                        ▼                 │
//! │          │            ┌─────────────────┐     ┌──────────────────────┐    │
//! │          └────────────│ DeliveryTracker │────►│ DispatchPipeline     │    │
//! │                       │ (save/delete)   │     │ → CollectionWatcher  │    │
//! │                       └─────────────────┘     └──────────────────────┘    │
//! │                                │                                          │
//! │                                ▼                                          │
//! │                       ┌─────────────────┐                                 │
//! │                       │ CheckpointStore │  Memory / SQLite / Mongo        │
//! │                       └─────────────────┘                                 │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Protocol
//!
//! For every event: save its checkpoint, delete the previous one, dispatch,
//! then mark the checkpoint delivered. A crash at any point resumes from the
//! newest checkpoint; an undelivered checkpoint is replayed, a delivered one
//! is not. An invalidate ends the attempt and the next one starts after the
//! invalidate's token.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use change_watch::{DocumentProcessor, WatchConfig};
//! use change_watch::config::TargetConfig;
//! # use change_watch::CollectionWatcher;
//! # use std::sync::Arc;
//!
//! # async fn run(client: mongodb::Client, handler: Arc<dyn CollectionWatcher>) -> change_watch::Result<()> {
//! let config = WatchConfig {
//!     target: TargetConfig::new("app", "users"),
//!     ..Default::default()
//! };
//! let processor = DocumentProcessor::from_config(&config, &client.database("app")).await?;
//!
//! // Runs until processor.stop() or the retry budget is spent
//! processor.start_with_retry(handler).await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod manager;
pub mod metrics;
pub mod processor;
pub mod source;
pub mod supervisor;
pub mod watcher;

// Re-exports for convenience
pub use checkpoint::{
    CheckpointStore, MemoryCheckpointStore, MongoCheckpointStore, SqliteCheckpointStore,
};
pub use config::WatchConfig;
pub use dispatch::{stage_fn, DispatchPipeline, DispatchStage};
pub use error::{BoxFuture, Result, WatchError};
pub use event::{
    ChangeEvent, CheckpointRecord, OperationType, ResumePoint, ResumeToken, StartPosition,
    Timestamp, UpdateDescription,
};
pub use manager::StreamManager;
pub use processor::{
    CollectionWatcher, DocumentDispatcher, DocumentProcessor, HandlerError, HandlerFuture,
};
pub use source::{
    open_with_fallback, ChangeFeedSource, EventCursor, ImageCaptureMode, MemoryChangeFeed,
    MongoChangeFeed, OpenRequest,
};
pub use supervisor::{BackoffPolicy, RetrySupervisor};
pub use watcher::{run_watch_loop, DeliveryTracker};
