// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence.
//!
//! A checkpoint is the durable record of the last event the watch loop saw.
//! The loop writes one per event and deletes the one before it, so in steady
//! state a watch owns exactly one record:
//!
//! ```text
//! save(e_k) ──► delete(e_{k-1}) ──► dispatch(e_k) ──► save(e_k, delivered)
//!   (crash here = two records, get_last() still picks e_k)
//! ```
//!
//! Three backends are provided:
//!
//! | Store | Use |
//! |-------|-----|
//! | [`MemoryCheckpointStore`] | tests, embedding, no durability |
//! | [`SqliteCheckpointStore`] | local durable state, WAL mode |
//! | [`MongoCheckpointStore`] | `<collection><suffix>_resume_points` collection |

mod memory;
mod mongo;
mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use mongo::{
    resume_collection_name as mongo_resume_collection_name, MongoCheckpointStore,
    RESUME_POINTS_SUFFIX,
};
pub use sqlite::SqliteCheckpointStore;

use crate::error::BoxFuture;
use crate::event::{CheckpointRecord, ResumeToken};

/// Keyed, upsertable, timestamp-ordered checkpoint storage.
///
/// Implementations must be safe to share across tasks; the watch loop holds
/// an `Arc<dyn CheckpointStore>`.
pub trait CheckpointStore: Send + Sync + 'static {
    /// The record with the greatest timestamp, or `None` on a cold start.
    fn get_last(&self) -> BoxFuture<'_, Option<CheckpointRecord>>;

    /// Idempotent upsert keyed by `record.id`.
    fn save(&self, record: CheckpointRecord) -> BoxFuture<'_, ()>;

    /// Remove the record with this token. Absent records are not an error.
    fn delete(&self, token: &ResumeToken) -> BoxFuture<'_, ()>;

    /// Number of stored records.
    fn count(&self) -> BoxFuture<'_, u64>;

    /// Every stored record, oldest first.
    fn fetch_all(&self) -> BoxFuture<'_, Vec<CheckpointRecord>>;
}
