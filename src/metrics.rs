// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Change events received and dispatched
//! - Watch lifecycle (active, restarts, invalidations)
//! - Failures by error kind
//! - Checkpoint store retries
//!
//! No recorder is installed here; the embedding process picks one.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `changefeed_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a change event received from the source.
pub fn record_event(collection: &str, operation: &str) {
    counter!(
        "changefeed_events_total",
        "collection" => collection.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record one pass through the dispatch pipeline.
pub fn record_dispatch(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "changefeed_dispatch_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("changefeed_dispatch_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Set whether a watch is currently running for a collection.
pub fn set_watch_active(collection: &str, active: bool) {
    gauge!("changefeed_watch_active", "collection" => collection.to_string())
        .set(if active { 1.0 } else { 0.0 });
}

/// Record an invalidate that ended a watch attempt.
pub fn record_invalidate(collection: &str) {
    counter!("changefeed_invalidations_total", "collection" => collection.to_string()).increment(1);
}

/// Record a failed watch attempt.
pub fn record_watch_error(collection: &str, kind: &str) {
    counter!(
        "changefeed_watch_errors_total",
        "collection" => collection.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a supervisor restart.
pub fn record_restart(collection: &str) {
    counter!("changefeed_restarts_total", "collection" => collection.to_string()).increment(1);
}

/// Record a reopen without pre-images.
pub fn record_pre_image_fallback(collection: &str) {
    counter!("changefeed_pre_image_fallbacks_total", "collection" => collection.to_string())
        .increment(1);
}

/// Record a resume where the checkpointed event was not replayed.
pub fn record_replay_miss(collection: &str) {
    counter!("changefeed_replay_misses_total", "collection" => collection.to_string()).increment(1);
}

/// Record checkpoint store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("changefeed_store_retries_total", "operation" => operation.to_string()).increment(1);
}
