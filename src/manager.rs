// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream manager: one cancellable watch at a time.
//!
//! [`StreamManager::watch`] claims the manager's single watch slot, resolves
//! where to resume, opens the source and runs the watch loop until it is
//! cancelled or fails. [`StreamManager::stop`] cancels whatever watch holds
//! the slot.
//!
//! ```text
//! watch() ──► claim slot ──► resume point ──► open (fallback) ──► run_watch_loop
//!    │             │                             ▲                    │
//!    │             └── InvalidState if taken     └── stop() ──────────┤
//!    └──────────────────────────── slot released on exit ◄────────────┘
//! ```

use crate::checkpoint::CheckpointStore;
use crate::dispatch::DispatchPipeline;
use crate::error::{Result, WatchError};
use crate::event::{ResumePoint, StartPosition};
use crate::metrics;
use crate::source::{open_with_fallback, ChangeFeedSource, ImageCaptureMode, OpenRequest};
use crate::watcher::{run_watch_loop, DeliveryTracker};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

type Slot = Mutex<Option<watch::Sender<bool>>>;

/// Releases the watch slot when the watch future completes or is dropped.
struct SlotGuard<'a> {
    slot: &'a Slot,
    collection: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        metrics::set_watch_active(self.collection, false);
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means the watch is over.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Owns the source, the checkpoint store and the active-watch slot.
pub struct StreamManager {
    source: Arc<dyn ChangeFeedSource>,
    store: Arc<dyn CheckpointStore>,
    capture: ImageCaptureMode,
    active: Slot,
}

impl StreamManager {
    pub fn new(source: Arc<dyn ChangeFeedSource>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            source,
            store,
            capture: ImageCaptureMode::default(),
            active: Mutex::new(None),
        }
    }

    /// Set which document images the source should attach.
    pub fn with_capture(mut self, capture: ImageCaptureMode) -> Self {
        self.capture = capture;
        self
    }

    pub fn capture(&self) -> ImageCaptureMode {
        self.capture
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn collection(&self) -> &str {
        self.source.name()
    }

    /// Whether a watch currently holds the slot.
    pub fn is_watching(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Cancel the active watch. Logged no-op when nothing is running.
    pub fn stop(&self) {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(tx) => {
                info!(collection = %self.source.name(), "Stopping change stream watch");
                tx.send_replace(true);
            }
            None => {
                error!(collection = %self.source.name(), "Stream manager stop called with no active watch");
            }
        }
    }

    /// Cancel the active watch if there is one. Returns whether one was running.
    pub(crate) fn cancel(&self) -> bool {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(tx) => {
                debug!(collection = %self.source.name(), "Cancelling change stream watch");
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    fn claim(&self) -> Result<watch::Receiver<bool>> {
        let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(WatchError::InvalidState {
                expected: "Idle".to_string(),
                actual: "Watching".to_string(),
            });
        }
        let (tx, rx) = watch::channel(false);
        *slot = Some(tx);
        Ok(rx)
    }

    /// Watch until cancelled or failed.
    ///
    /// Resumes from `resume` if given, otherwise from the store's last
    /// checkpoint, otherwise from "now". Returns `Ok(())` only when
    /// [`stop`](Self::stop) cancelled the watch.
    pub async fn watch(&self, resume: Option<ResumePoint>, pipeline: &DispatchPipeline) -> Result<()> {
        let shutdown_rx = self.claim()?;
        let collection = self.source.name().to_string();
        let _guard = SlotGuard {
            slot: &self.active,
            collection: self.source.name(),
        };
        metrics::set_watch_active(&collection, true);

        let span = info_span!("watch", collection = %collection);
        async move {
            let resume = match resume {
                Some(point) => Some(point),
                None => self.store.get_last().await?.map(ResumePoint::from),
            };
            let position = StartPosition::from_resume(resume.as_ref());
            match &resume {
                Some(point) => info!(
                    token = %point.token,
                    ts = %point.timestamp,
                    op = %point.operation_type,
                    delivered = point.delivered,
                    "Resuming watch from checkpoint"
                ),
                None => info!("Starting watch without checkpoint"),
            }

            let request = OpenRequest::new(position, self.capture);
            let mut open_rx = shutdown_rx.clone();
            let cursor = tokio::select! {
                biased;

                _ = cancelled(&mut open_rx) => {
                    info!("Watch cancelled while opening change stream");
                    return Ok(());
                }
                opened = open_with_fallback(self.source.as_ref(), request) => opened?,
            };

            let tracker = DeliveryTracker::new(Arc::clone(&self.store), collection.clone(), resume.as_ref());
            run_watch_loop(cursor, tracker, pipeline, shutdown_rx).await
        }
        .instrument(span)
        .await
    }
}
