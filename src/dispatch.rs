// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch pipeline.
//!
//! An ordered chain of [`DispatchStage`]s. Every stage sees the event and the
//! result of the stage before it, and decides whether to act, pass the error
//! on, or recover from it. The last stage's result is the pipeline's result.
//!
//! ```text
//! Ok(()) ──► stage 1 ──► stage 2 ──► ... ──► stage n ──► result
//! ```
//!
//! Stages run strictly in order and are awaited one at a time. The pipeline
//! never touches checkpoints; that is the watch loop's job.
//!
//! # Example
//!
//! ```rust,no_run
//! use change_watch::dispatch::{stage_fn, DispatchPipeline};
//!
//! let pipeline = DispatchPipeline::new()
//!     .with_stage(stage_fn(|event, prior| async move {
//!         prior?;
//!         println!("{} {}", event.operation_type, event.id);
//!         Ok::<_, change_watch::WatchError>(())
//!     }));
//! ```

use crate::error::{BoxFuture, Result};
use crate::event::ChangeEvent;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// One link in the dispatch chain.
pub trait DispatchStage: Send + Sync + 'static {
    /// Handle `event` given the previous stage's result.
    fn dispatch<'a>(&'a self, event: &'a ChangeEvent, prior: Result<()>) -> BoxFuture<'a, ()>;
}

/// Ordered list of stages, shared by every watch attempt.
#[derive(Clone, Default)]
pub struct DispatchPipeline {
    stages: Vec<Arc<dyn DispatchStage>>,
}

impl DispatchPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with_stage(mut self, stage: impl DispatchStage) -> Self {
        self.push(stage);
        self
    }

    pub fn push(&mut self, stage: impl DispatchStage) {
        self.stages.push(Arc::new(stage));
    }

    pub fn push_arc(&mut self, stage: Arc<dyn DispatchStage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Fold the event through every stage. An empty pipeline yields `Ok(())`.
    pub async fn run(&self, event: &ChangeEvent) -> Result<()> {
        let start = Instant::now();
        let mut result = Ok(());
        for stage in &self.stages {
            result = stage.dispatch(event, result).await;
        }

        trace!(
            token = %event.id,
            op = %event.operation_type,
            stages = self.stages.len(),
            ok = result.is_ok(),
            "Dispatched event"
        );
        crate::metrics::record_dispatch(
            event.operation_type.as_str(),
            result.is_ok(),
            start.elapsed(),
        );
        result
    }
}

/// Stage built from an async closure. See [`stage_fn`].
pub struct FnStage<F> {
    f: F,
}

/// Adapt an async closure into a [`DispatchStage`].
///
/// The closure receives an owned copy of the event so the returned future can
/// be `'static`.
pub fn stage_fn<F, Fut>(f: F) -> FnStage<F>
where
    F: Fn(ChangeEvent, Result<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnStage { f }
}

impl<F, Fut> DispatchStage for FnStage<F>
where
    F: Fn(ChangeEvent, Result<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn dispatch<'a>(&'a self, event: &'a ChangeEvent, prior: Result<()>) -> BoxFuture<'a, ()> {
        Box::pin((self.f)(event.clone(), prior))
    }
}
