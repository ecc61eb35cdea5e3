// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry supervision for the watch loop.
//!
//! [`RetrySupervisor::run`] keeps a [`StreamManager`] watching:
//!
//! | Watch result | Action |
//! |--------------|--------|
//! | `Ok(())` | cancelled, return `Ok(())` |
//! | `Invalidate` | reset backoff, restart after `initial_interval` |
//! | any other error | wait `delay_for_attempt(n)`, retry |
//!
//! Retrying is unbounded by default. `max_attempts` and `max_elapsed_time`
//! bound a run of consecutive failures; once exceeded the last error is
//! returned. An invalidate is not a failure and resets both.
//!
//! [`RetrySupervisor::shutdown`] ends the current run wherever it is: during
//! backoff, or mid-watch by cancelling the manager. The next `run` clears
//! the flag, so a supervisor can be started again after a stop.
//!
//! # Backoff Schedule (default)
//!
//! ```text
//! Attempt  Delay
//! -------  -----
//! 1        500ms
//! 2        750ms
//! 3        1.12s
//! 4        1.69s
//! ...
//! 12+      60s (cap)
//! ```

use crate::dispatch::DispatchPipeline;
use crate::error::Result;
use crate::manager::StreamManager;
use crate::metrics;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exponential backoff with optional bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry, and after an invalidate.
    pub initial_interval: Duration,

    /// Growth factor per consecutive failure.
    pub multiplier: f64,

    /// Ceiling for a single delay.
    pub max_interval: Duration,

    /// Give up once a failure streak has lasted this long. `None` = never.
    pub max_elapsed_time: Option<Duration>,

    /// Give up after this many consecutive failures. `None` = never.
    pub max_attempts: Option<usize>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Fast, bounded policy for tests.
    pub fn testing() -> Self {
        Self {
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            max_interval: Duration::from_millis(100),
            max_elapsed_time: None,
            max_attempts: Some(3),
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_interval;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }

        Duration::from_secs_f64(delay_secs)
    }

    /// Whether a failure streak of `attempts` lasting `elapsed` should stop.
    pub fn is_exhausted(&self, attempts: usize, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.max_elapsed_time.is_some_and(|max| elapsed >= max)
    }
}

/// Restarts a [`StreamManager`] under a [`BackoffPolicy`].
pub struct RetrySupervisor {
    policy: BackoffPolicy,
    shutdown_tx: watch::Sender<bool>,
}

impl RetrySupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            policy,
            shutdown_tx,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// End the current run. Interrupts a pending backoff sleep and cancels
    /// a watch started by [`run`](Self::run).
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Supervise `manager` until cancelled, shut down, or out of retries.
    pub async fn run(&self, manager: &StreamManager, pipeline: &DispatchPipeline) -> Result<()> {
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let collection = manager.collection().to_string();
        let mut failures = 0usize;
        let mut streak_start: Option<Instant> = None;

        loop {
            if *shutdown_rx.borrow() {
                info!(collection = %collection, "Supervisor shut down");
                return Ok(());
            }

            // The watch claims the manager's slot on its first poll, so a
            // shutdown observed here always has a watch to cancel.
            let watch = manager.watch(None, pipeline);
            tokio::pin!(watch);
            let result = tokio::select! {
                biased;

                result = &mut watch => result,
                _ = async { shutdown_rx.wait_for(|stop| *stop).await.map(|_| ()) } => {
                    manager.cancel();
                    let _ = watch.await;
                    info!(collection = %collection, "Supervisor shut down");
                    return Ok(());
                }
            };

            let delay = match result {
                Ok(()) => {
                    info!(collection = %collection, "Watch cancelled, supervisor exiting");
                    return Ok(());
                }
                Err(e) if e.is_invalidate() => {
                    warn!(
                        collection = %collection,
                        error = %e,
                        "Change stream invalidated, restarting after invalidate token"
                    );
                    metrics::record_invalidate(&collection);
                    // The finished watch has already released the slot
                    failures = 0;
                    streak_start = None;
                    self.policy.initial_interval
                }
                Err(e) => {
                    failures += 1;
                    let started = *streak_start.get_or_insert_with(Instant::now);
                    error!(
                        collection = %collection,
                        attempt = failures,
                        kind = e.kind(),
                        error = %e,
                        "Change stream watch failed"
                    );
                    metrics::record_watch_error(&collection, e.kind());

                    if self.policy.is_exhausted(failures, started.elapsed()) {
                        error!(
                            collection = %collection,
                            attempts = failures,
                            "Retry budget exhausted, giving up"
                        );
                        return Err(e);
                    }
                    self.policy.delay_for_attempt(failures)
                }
            };

            metrics::record_restart(&collection);
            tokio::select! {
                biased;

                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    info!(collection = %collection, "Supervisor shut down during backoff");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
