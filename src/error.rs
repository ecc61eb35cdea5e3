// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the change stream watcher.
//!
//! Errors are categorized by their source (change feed, checkpoint store,
//! handler, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Kind | Description |
//! |------------|------|-------------|
//! | `Invalidate` | control flow | Watched collection dropped/renamed, cursor is dead |
//! | `Source` | transient | Network errors, cursor open failures |
//! | `PreImageUnavailable` | transient | Pre-image history expired, open is retried without it |
//! | `Checkpoint` / `CheckpointSql` | store | Checkpoint read/write failed |
//! | `Serialization` | data | Malformed change event or payload |
//! | `Handler` | dispatch | Collaborator rejected an insert/update/delete |
//! | `Dispatch` | dispatch | A generic pipeline stage failed |
//! | `Config` | setup | Configuration invalid |
//! | `InvalidState` | caller | Watch already running, etc. |
//! | `Shutdown` / `Internal` | misc | Terminating / unexpected |
//!
//! # Invalidate Is Not a Failure
//!
//! [`WatchError::Invalidate`] is how the watch loop tells the
//! [`RetrySupervisor`](crate::supervisor::RetrySupervisor) that the cursor must be
//! reopened *after* the invalidate token. Match on it with
//! [`is_invalidate()`](WatchError::is_invalidate); everything else is retried
//! under backoff.

use crate::event::ResumeToken;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for watch operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Boxed async result, used by the object-safe store/source/stage traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while watching a change feed.
#[derive(Error, Debug)]
pub enum WatchError {
    /// The change feed emitted an `invalidate` event.
    ///
    /// The watched collection was dropped, renamed or otherwise made
    /// unrecoverable at its current position. The next attempt must resume
    /// strictly after `token`.
    #[error("received 'invalidate' event ({token})")]
    Invalidate { token: ResumeToken },

    /// Change feed open or iteration error.
    #[error("Change feed error ({operation}): {message}")]
    Source {
        operation: String,
        message: String,
        #[source]
        source: Option<mongodb::error::Error>,
    },

    /// The source rejected pre-image capture because history has expired.
    #[error("Pre-image unavailable: {0}")]
    PreImageUnavailable(String),

    /// Checkpoint store failure (non-SQL backends).
    #[error("Checkpoint store error ({operation}): {message}")]
    Checkpoint { operation: String, message: String },

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointSql(#[from] sqlx::Error),

    /// Change event or document payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A collection watcher rejected a document.
    #[error("Handler error ({operation}): {message}")]
    Handler { operation: String, message: String },

    /// A dispatch stage failed.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WatchError {
    /// Create a source error from a driver error.
    pub fn feed(operation: impl Into<String>, source: mongodb::error::Error) -> Self {
        Self::Source {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a source error without an underlying driver error.
    pub fn feed_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a checkpoint store error.
    pub fn checkpoint(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Checkpoint {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Check if this is the distinguished invalidate condition.
    pub fn is_invalidate(&self) -> bool {
        matches!(self, Self::Invalidate { .. })
    }

    /// Short label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invalidate { .. } => "invalidate",
            Self::Source { .. } => "source",
            Self::PreImageUnavailable(_) => "pre_image_unavailable",
            Self::Checkpoint { .. } | Self::CheckpointSql(_) => "checkpoint",
            Self::Serialization(_) => "serialization",
            Self::Handler { .. } => "handler",
            Self::Dispatch(_) => "dispatch",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for WatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<mongodb::bson::de::Error> for WatchError {
    fn from(e: mongodb::bson::de::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for WatchError {
    fn from(e: mongodb::bson::ser::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
