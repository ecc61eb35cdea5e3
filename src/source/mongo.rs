// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MongoDB change stream source.
//!
//! Opens `collection.watch()` with a fixed aggregation pipeline:
//!
//! ```text
//! $match      operationType in (insert, update, delete, invalidate)
//! $addFields  timestamp   <- $clusterTime
//!             database    <- $ns.db
//!             collection  <- $ns.coll
//!             documentKey <- $documentKey._id
//! $project    the fields above + fullDocument, fullDocumentBeforeChange,
//!             updateDescription (and the implicit _id resume token)
//! ```
//!
//! The reshaped documents no longer match the driver's event type, so the
//! stream is read as raw [`Document`]s and normalized by
//! [`parse_change_document`]. Resume tokens travel as canonical extended JSON
//! strings and are decoded back to the driver's token type on open.

use super::{ChangeFeedSource, EventCursor, OpenRequest, StartPosition};
use crate::error::{BoxFuture, Result, WatchError};
use crate::event::{ChangeEvent, OperationType, ResumeToken, Timestamp, UpdateDescription};
use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::{Collection, Database};
use std::str::FromStr;
use tracing::{debug, trace, warn};

/// Server error text for an expired pre-image history.
const NO_MATCHING_DOCUMENT: &str = "NoMatchingDocument";

/// Aggregation pipeline applied to every change stream.
pub fn build_pipeline() -> Vec<Document> {
    vec![
        doc! {
            "$match": {
                "$or": [
                    { "operationType": "insert" },
                    { "operationType": "update" },
                    { "operationType": "delete" },
                    { "operationType": "invalidate" },
                ]
            }
        },
        doc! {
            "$addFields": {
                "timestamp": "$clusterTime",
                "database": "$ns.db",
                "collection": "$ns.coll",
                "documentKey": "$documentKey._id",
            }
        },
        doc! {
            "$project": {
                "timestamp": 1,
                "operationType": 1,
                "database": 1,
                "collection": 1,
                "documentKey": 1,
                "fullDocument": 1,
                "fullDocumentBeforeChange": 1,
                "updateDescription": 1,
            }
        },
    ]
}

fn encode_token(id: Bson) -> ResumeToken {
    ResumeToken::new(id.into_canonical_extjson().to_string())
}

fn decode_token(token: &ResumeToken) -> Result<mongodb::change_stream::event::ResumeToken> {
    let json: serde_json::Value = serde_json::from_str(token.as_str())?;
    let bson = Bson::try_from(json).map_err(|e| WatchError::Serialization(e.to_string()))?;
    let Bson::Document(document) = bson else {
        return Err(WatchError::Serialization(format!(
            "resume token is not a document: {}",
            token
        )));
    };
    let bytes = mongodb::bson::to_vec(&document)?;
    Ok(mongodb::bson::from_slice(&bytes)?)
}

fn render_document_key(key: &Bson) -> String {
    match key {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

fn optional_document(document: &Document, key: &str) -> Option<serde_json::Value> {
    match document.get(key) {
        None | Some(Bson::Null) => None,
        Some(b) => Some(b.clone().into_relaxed_extjson()),
    }
}

/// Normalize one reshaped change stream document.
///
/// Returns `Ok(None)` for operation types outside the watched set; the
/// `$match` stage should already have dropped them.
pub fn parse_change_document(document: Document) -> Result<Option<ChangeEvent>> {
    let malformed = |e: mongodb::bson::document::ValueAccessError| {
        WatchError::Serialization(format!("malformed change event: {}", e))
    };

    let op = document.get_str("operationType").map_err(malformed)?;
    let operation_type = match OperationType::from_str(op) {
        Ok(t) => t,
        Err(_) => {
            trace!(operation_type = op, "Skipping unwatched operation type");
            return Ok(None);
        }
    };

    let id = document
        .get("_id")
        .cloned()
        .ok_or_else(|| WatchError::Serialization("change event without _id".to_string()))?;
    let ts = document.get_timestamp("timestamp").map_err(malformed)?;

    let update_description = match optional_document(&document, "updateDescription") {
        Some(value) => Some(serde_json::from_value::<UpdateDescription>(value)?),
        None => None,
    };

    Ok(Some(ChangeEvent {
        id: encode_token(id),
        operation_type,
        timestamp: Timestamp::new(ts.time, ts.increment),
        database: document.get_str("database").ok().map(str::to_string),
        collection: document.get_str("collection").ok().map(str::to_string),
        document_key: document.get("documentKey").map(render_document_key),
        full_document: optional_document(&document, "fullDocument"),
        full_document_before_change: optional_document(&document, "fullDocumentBeforeChange"),
        update_description,
    }))
}

fn change_stream_options(request: &OpenRequest) -> Result<ChangeStreamOptions> {
    let mut options = ChangeStreamOptions::default();
    if request.capture.includes_update_lookup() {
        options.full_document = Some(FullDocumentType::UpdateLookup);
    }
    if request.capture.includes_pre_images() {
        options.full_document_before_change = Some(FullDocumentBeforeChangeType::Required);
    }
    match &request.position {
        StartPosition::Now => {}
        StartPosition::StartAfter(token) => {
            options.start_after = Some(decode_token(token)?);
        }
        StartPosition::StartAtOperationTime(ts) => {
            options.start_at_operation_time = Some(mongodb::bson::Timestamp {
                time: ts.time,
                increment: ts.increment,
            });
        }
    }
    Ok(options)
}

/// [`ChangeFeedSource`] over a MongoDB collection's change stream.
///
/// Requires a replica set or sharded cluster.
#[derive(Clone)]
pub struct MongoChangeFeed {
    collection: Collection<Document>,
}

impl MongoChangeFeed {
    pub fn new(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    pub fn from_database(database: &Database, collection: &str) -> Self {
        Self::new(database.collection(collection))
    }

    async fn open_stream(&self, request: OpenRequest) -> Result<EventCursor> {
        let options = change_stream_options(&request)?;
        debug!(
            collection = %self.collection.name(),
            position = ?request.position,
            capture = ?request.capture,
            "Opening change stream"
        );

        let stream = self
            .collection
            .watch()
            .pipeline(build_pipeline())
            .with_options(options)
            .await
            .map_err(|e| {
                if e.to_string().contains(NO_MATCHING_DOCUMENT) {
                    WatchError::PreImageUnavailable(e.to_string())
                } else {
                    WatchError::feed("open", e)
                }
            })?
            .with_type::<Document>();

        let collection = self.collection.name().to_string();
        let cursor = stream.filter_map(move |item| {
            let collection = collection.clone();
            async move {
                match item {
                    Ok(document) => parse_change_document(document).transpose(),
                    Err(e) => {
                        warn!(collection = %collection, error = %e, "Change stream error");
                        Some(Err(WatchError::feed("next", e)))
                    }
                }
            }
        });

        Ok(cursor.boxed())
    }
}

impl ChangeFeedSource for MongoChangeFeed {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, EventCursor> {
        Box::pin(self.open_stream(request))
    }

    fn name(&self) -> &str {
        self.collection.name()
    }
}
