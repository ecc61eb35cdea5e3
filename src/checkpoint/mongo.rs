// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MongoDB checkpoint store.
//!
//! One collection per watch, named `<target collection><suffix>_resume_points`.
//! Each document is:
//!
//! ```text
//! { _id: <resume token>, timestamp: Timestamp(t, i), operationType: "...",
//!   fullDocument: {...}, delivered: bool }
//! ```
//!
//! `get_last()` sorts on the BSON timestamp, so a leftover record from a crash
//! between save and delete never shadows the newer one.

use super::CheckpointStore;
use crate::error::{BoxFuture, Result, WatchError};
use crate::event::{CheckpointRecord, OperationType, ResumeToken, Timestamp};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Collection, Database};
use std::str::FromStr;
use tracing::{debug, info};

/// Suffix appended to every checkpoint collection name.
pub const RESUME_POINTS_SUFFIX: &str = "_resume_points";

/// Name of the checkpoint collection for a watched collection.
pub fn resume_collection_name(target_collection: &str, suffix: &str) -> String {
    format!("{}{}{}", target_collection, suffix, RESUME_POINTS_SUFFIX)
}

fn to_document(record: &CheckpointRecord) -> Result<Document> {
    let mut document = doc! {
        "_id": record.id.as_str(),
        "timestamp": mongodb::bson::Timestamp {
            time: record.timestamp.time,
            increment: record.timestamp.increment,
        },
        "operationType": record.operation_type.as_str(),
        "delivered": record.delivered,
    };
    if let Some(full) = &record.full_document {
        let bson = Bson::try_from(full.clone())
            .map_err(|e| WatchError::Serialization(e.to_string()))?;
        document.insert("fullDocument", bson);
    }
    Ok(document)
}

fn from_document(document: Document) -> Result<CheckpointRecord> {
    let decode = |e: mongodb::bson::document::ValueAccessError| WatchError::checkpoint("decode", e);

    let id = ResumeToken::new(document.get_str("_id").map_err(decode)?);
    let ts = document.get_timestamp("timestamp").map_err(decode)?;
    let operation_type = OperationType::from_str(document.get_str("operationType").map_err(decode)?)
        .map_err(|e| WatchError::checkpoint("decode", e))?;
    let full_document = match document.get("fullDocument") {
        None | Some(Bson::Null) => None,
        Some(b) => Some(b.clone().into_relaxed_extjson()),
    };
    let delivered = document.get_bool("delivered").unwrap_or(false);

    Ok(CheckpointRecord {
        id,
        timestamp: Timestamp::new(ts.time, ts.increment),
        operation_type,
        full_document,
        delivered,
    })
}

/// Checkpoint store backed by a MongoDB collection.
#[derive(Clone)]
pub struct MongoCheckpointStore {
    collection: Collection<Document>,
}

impl MongoCheckpointStore {
    /// Store for `target_collection` inside `local_db`.
    ///
    /// Use distinct suffixes when several processors watch the same
    /// collection, otherwise they will reclaim each other's checkpoints.
    pub fn new(local_db: &Database, target_collection: &str, suffix: &str) -> Self {
        let name = resume_collection_name(target_collection, suffix);
        info!(collection = %name, "Using MongoDB checkpoint store");
        Self {
            collection: local_db.collection(&name),
        }
    }

    /// Wrap an existing collection.
    pub fn from_collection(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }
}

impl CheckpointStore for MongoCheckpointStore {
    fn get_last(&self) -> BoxFuture<'_, Option<CheckpointRecord>> {
        Box::pin(async move {
            let found = self
                .collection
                .find_one(doc! {})
                .sort(doc! { "timestamp": -1 })
                .await
                .map_err(|e| WatchError::checkpoint("get_last", e))?;
            found.map(from_document).transpose()
        })
    }

    fn save(&self, record: CheckpointRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let document = to_document(&record)?;
            self.collection
                .replace_one(doc! { "_id": record.id.as_str() }, document)
                .upsert(true)
                .await
                .map_err(|e| WatchError::checkpoint("save", e))?;
            debug!(
                collection = %self.collection.name(),
                token = %record.id,
                delivered = record.delivered,
                "Checkpoint saved"
            );
            Ok(())
        })
    }

    fn delete(&self, token: &ResumeToken) -> BoxFuture<'_, ()> {
        let token = token.clone();
        Box::pin(async move {
            self.collection
                .delete_one(doc! { "_id": token.as_str() })
                .await
                .map_err(|e| WatchError::checkpoint("delete", e))?;
            debug!(collection = %self.collection.name(), token = %token, "Checkpoint deleted");
            Ok(())
        })
    }

    fn count(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.collection
                .count_documents(doc! {})
                .await
                .map_err(|e| WatchError::checkpoint("count", e))
        })
    }

    fn fetch_all(&self) -> BoxFuture<'_, Vec<CheckpointRecord>> {
        Box::pin(async move {
            let documents: Vec<Document> = self
                .collection
                .find(doc! {})
                .sort(doc! { "timestamp": 1 })
                .await
                .map_err(|e| WatchError::checkpoint("fetch_all", e))?
                .try_collect()
                .await
                .map_err(|e| WatchError::checkpoint("fetch_all", e))?;
            documents.into_iter().map(from_document).collect()
        })
    }
}
