// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed sources.
//!
//! A [`ChangeFeedSource`] opens an [`EventCursor`]: an ordered, resumable
//! stream of [`ChangeEvent`]s for one collection, filtered to
//! insert/update/delete/invalidate.
//!
//! # Start Positions
//!
//! | Resume point | Position | First event |
//! |--------------|----------|-------------|
//! | none | [`StartPosition::Now`] | next mutation after open |
//! | ordinary checkpoint | [`StartPosition::StartAtOperationTime`] | the checkpointed event (replay) |
//! | invalidate checkpoint | [`StartPosition::StartAfter`] | first event after the invalidate |
//!
//! # Pre-image Fallback
//!
//! With [`ImageCaptureMode::Required`] the server refuses to open a cursor
//! whose pre-image history has expired. [`open_with_fallback`] retries such an
//! open exactly once with pre-images disabled.

mod memory;
mod mongo;

pub use memory::MemoryChangeFeed;
pub use mongo::{build_pipeline, parse_change_document, MongoChangeFeed};

pub use crate::event::StartPosition;

use crate::error::{BoxFuture, Result, WatchError};
use crate::event::ChangeEvent;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Ordered stream of change events. Ends only on error or after an invalidate.
pub type EventCursor = BoxStream<'static, Result<ChangeEvent>>;

/// Which document images the source attaches to events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCaptureMode {
    /// Neither post-image lookup for updates nor pre-images.
    Off,
    /// Post-image lookup for updates, no pre-images.
    #[default]
    UpdateLookup,
    /// Post-image lookup plus required pre-images.
    Required,
}

impl ImageCaptureMode {
    pub fn includes_pre_images(&self) -> bool {
        matches!(self, Self::Required)
    }

    pub fn includes_update_lookup(&self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Same mode with pre-images dropped.
    pub fn without_pre_images(self) -> Self {
        match self {
            Self::Required => Self::UpdateLookup,
            other => other,
        }
    }
}

/// Parameters for opening a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub position: StartPosition,
    pub capture: ImageCaptureMode,
}

impl OpenRequest {
    pub fn new(position: StartPosition, capture: ImageCaptureMode) -> Self {
        Self { position, capture }
    }
}

/// A resumable change feed for a single collection.
pub trait ChangeFeedSource: Send + Sync + 'static {
    /// Open a cursor at the requested position.
    ///
    /// Returns [`WatchError::PreImageUnavailable`] when pre-images were
    /// required but the source no longer has them.
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, EventCursor>;

    /// Label for logs and metrics (usually the collection name).
    fn name(&self) -> &str;
}

/// Open a cursor, retrying once without pre-images if their history expired.
pub async fn open_with_fallback(
    source: &dyn ChangeFeedSource,
    request: OpenRequest,
) -> Result<EventCursor> {
    match source.open(request.clone()).await {
        Err(WatchError::PreImageUnavailable(message)) if request.capture.includes_pre_images() => {
            error!(
                collection = %source.name(),
                error = %message,
                "Pre-images unavailable, reopening without them"
            );
            crate::metrics::record_pre_image_fallback(source.name());
            let fallback = OpenRequest {
                capture: request.capture.without_pre_images(),
                ..request
            };
            source.open(fallback).await
        }
        other => other,
    }
}
