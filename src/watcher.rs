// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The watch loop: checkpoint-then-dispatch over an open cursor.
//!
//! # Per-event Protocol
//!
//! ```text
//! save(e, delivered=false)     e is now durable, resume point moves to e
//! delete(previous)             only after the save succeeded
//! dispatch(e)                  error => return, e is redelivered on restart
//! save(e, delivered=true)      a restart will not dispatch e again
//! invalidate?                  => Err(Invalidate { token: e.id })
//! ```
//!
//! A crash between save and delete leaves two checkpoints. `get_last()`
//! resolves the newer one, and the first event handled after the resume
//! sweeps every other record out of the store.
//!
//! # Warm Resume
//!
//! Resuming by timestamp replays every event at the checkpoint's cluster
//! time. Events sharing that time (one transaction) that precede the
//! checkpointed event are skipped. The checkpointed event itself is already
//! stored, so nothing is saved for it; it is dispatched again only if it
//! never completed dispatch, which gives at-least-once delivery without
//! duplicating work after a clean stop.
//!
//! Resuming after an invalidate opens strictly after the invalidate token, so
//! the first event is new and reclaims the invalidate checkpoint.
//!
//! # Cancellation
//!
//! [`run_watch_loop`] races the cursor against a shutdown channel with a
//! biased `select!`. In-flight store and dispatch calls finish; cancellation
//! takes effect at the next event boundary.

use crate::checkpoint::CheckpointStore;
use crate::dispatch::DispatchPipeline;
use crate::error::{Result, WatchError};
use crate::event::{ChangeEvent, CheckpointRecord, ResumePoint, ResumeToken};
use crate::metrics;
use crate::source::EventCursor;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Per-watch checkpoint state machine.
pub struct DeliveryTracker {
    store: Arc<dyn CheckpointStore>,
    collection: String,
    /// Checkpoint to reclaim after the next save.
    previous: Option<ResumeToken>,
    /// Set after a timestamp resume; the source replays this event first.
    pending_replay: Option<ResumePoint>,
    /// Records other than the current one may survive a crash.
    sweep_pending: bool,
}

impl DeliveryTracker {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        collection: impl Into<String>,
        resume: Option<&ResumePoint>,
    ) -> Self {
        let (previous, pending_replay) = match resume {
            None => (None, None),
            Some(r) if r.requires_start_after() => (Some(r.token.clone()), None),
            Some(r) => (None, Some(r.clone())),
        };
        Self {
            store,
            collection: collection.into(),
            previous,
            pending_replay,
            sweep_pending: resume.is_some(),
        }
    }

    /// Token that the next save will reclaim.
    pub fn previous(&self) -> Option<&ResumeToken> {
        self.previous.as_ref()
    }

    /// Whether the replayed checkpoint event is still expected.
    pub fn awaiting_replay(&self) -> bool {
        self.pending_replay.is_some()
    }

    /// Run one event through the protocol.
    ///
    /// Returns [`WatchError::Invalidate`] after an invalidate event has been
    /// checkpointed and dispatched.
    pub async fn process(&mut self, event: &ChangeEvent, pipeline: &DispatchPipeline) -> Result<()> {
        trace!(token = %event.id, op = %event.operation_type, ts = %event.timestamp, "Received event");
        metrics::record_event(&self.collection, event.operation_type.as_str());

        if let Some(resume) = self.pending_replay.take() {
            if event.id == resume.token {
                return self.replay(event, &resume, pipeline).await;
            }
            if event.timestamp <= resume.timestamp {
                trace!(
                    token = %event.id,
                    checkpoint = %resume.token,
                    "Skipping event ordered before the checkpoint at the same cluster time"
                );
                self.pending_replay = Some(resume);
                return Ok(());
            }
            warn!(
                collection = %self.collection,
                expected = %resume.token,
                received = %event.id,
                "Checkpointed event not replayed by source, continuing from next event"
            );
            metrics::record_replay_miss(&self.collection);
            self.previous = Some(resume.token);
        }

        self.store.save(CheckpointRecord::from(event)).await?;
        debug!(token = %event.id, "Checkpoint advanced");

        if self.sweep_pending {
            self.previous = None;
            self.sweep_except(&event.id).await?;
        } else if let Some(previous) = self.previous.take() {
            if previous != event.id {
                self.store.delete(&previous).await?;
                debug!(token = %previous, "Previous checkpoint reclaimed");
            }
        }

        if let Err(e) = pipeline.run(event).await {
            warn!(
                collection = %self.collection,
                token = %event.id,
                op = %event.operation_type,
                error = %e,
                "Dispatch failed, event will be redelivered on restart"
            );
            return Err(e);
        }

        self.store
            .save(CheckpointRecord::from(event).into_delivered())
            .await?;
        self.complete(event)
    }

    async fn replay(
        &mut self,
        event: &ChangeEvent,
        resume: &ResumePoint,
        pipeline: &DispatchPipeline,
    ) -> Result<()> {
        if resume.delivered {
            debug!(token = %event.id, "Replayed checkpoint already delivered, skipping dispatch");
        } else {
            info!(
                collection = %self.collection,
                token = %event.id,
                "Redelivering undelivered checkpoint"
            );
            pipeline.run(event).await?;
            self.store
                .save(CheckpointRecord::from(event).into_delivered())
                .await?;
        }
        if self.sweep_pending {
            self.sweep_except(&event.id).await?;
        }
        self.complete(event)
    }

    /// Delete every stored checkpoint except `keep`.
    async fn sweep_except(&mut self, keep: &ResumeToken) -> Result<()> {
        let stale: Vec<_> = self
            .store
            .fetch_all()
            .await?
            .into_iter()
            .filter(|record| &record.id != keep)
            .collect();
        for record in &stale {
            self.store.delete(&record.id).await?;
        }
        if !stale.is_empty() {
            info!(
                collection = %self.collection,
                reclaimed = stale.len(),
                "Reclaimed checkpoints left by an interrupted run"
            );
        }
        self.sweep_pending = false;
        Ok(())
    }

    fn complete(&mut self, event: &ChangeEvent) -> Result<()> {
        if event.is_invalidate() {
            info!(
                collection = %self.collection,
                token = %event.id,
                "Received 'invalidate' event, cursor must be reopened after it"
            );
            return Err(WatchError::Invalidate {
                token: event.id.clone(),
            });
        }
        self.previous = Some(event.id.clone());
        Ok(())
    }
}

/// Drive `cursor` through `tracker` until cancelled or an error occurs.
///
/// Returns `Ok(())` only when `shutdown_rx` fires (or its sender is gone).
/// A cursor that ends on its own is reported as a source error.
pub async fn run_watch_loop(
    mut cursor: EventCursor,
    mut tracker: DeliveryTracker,
    pipeline: &DispatchPipeline,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    info!("Change stream watcher launched, waiting for change events");

    loop {
        if *shutdown_rx.borrow() {
            info!("Shutdown signal received, stopping watch");
            return Ok(());
        }

        let next = tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping watch");
                    return Ok(());
                }
                continue;
            }
            item = cursor.next() => item,
        };

        match next {
            Some(Ok(event)) => tracker.process(&event, pipeline).await?,
            Some(Err(e)) => {
                warn!(error = %e, "Change stream cursor error");
                return Err(e);
            }
            None => {
                return Err(WatchError::feed_msg(
                    "next",
                    "change stream ended without cancellation",
                ));
            }
        }
    }
}
