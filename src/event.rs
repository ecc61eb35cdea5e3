// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events, checkpoints and resume points.
//!
//! These are the transport-neutral shapes the watch loop works with. Source
//! adapters (see [`crate::source`]) normalize their native events into
//! [`ChangeEvent`]; the watch loop derives a [`CheckpointRecord`] from every
//! event it records, and a [`ResumePoint`] is derived from the newest stored
//! checkpoint when a watch starts.
//!
//! Documents are carried as [`serde_json::Value`] so that handlers and stores
//! never depend on the source's wire format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Opaque, source-assigned position in the change feed.
///
/// Only the source can order tokens; everything else treats them as keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source-assigned logical time (seconds + ordinal within the second).
///
/// Ordering is lexicographic on `(time, increment)`, the same as a BSON
/// timestamp, and is monotonically non-decreasing per collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

impl Timestamp {
    pub fn new(time: u32, increment: u32) -> Self {
        Self { time, increment }
    }

    /// Pack into a single sortable integer (`time` in the high 32 bits).
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.time) << 32) | u64::from(self.increment)
    }

    pub fn from_u64(packed: u64) -> Self {
        Self {
            time: (packed >> 32) as u32,
            increment: packed as u32,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.time, self.increment)
    }
}

/// Change event operation type.
///
/// The feed is filtered at the source to these four kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    /// The watched collection was dropped/renamed; the cursor is dead.
    Invalidate,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Invalidate => "invalidate",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "invalidate" => Ok(Self::Invalidate),
            other => Err(format!("unsupported operation type: {}", other)),
        }
    }
}

/// Fields touched by an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Map<String, Value>,
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

/// A normalized mutation record from the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "_id")]
    pub id: ResumeToken,
    pub operation_type: OperationType,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// `_id` of the mutated document. Some collections use custom keys, so
    /// this is always rendered as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<String>,
    /// Post-image (insert, and update with lookup enabled).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    /// Pre-image, only when capture is enabled on the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document_before_change: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,
}

impl ChangeEvent {
    /// Check if this event marks the cursor as dead.
    pub fn is_invalidate(&self) -> bool {
        self.operation_type == OperationType::Invalidate
    }

    /// The document view handed to collaborators.
    ///
    /// Deletes prefer the pre-image and fall back to the post-image; every
    /// other operation uses the post-image.
    pub fn payload_document(&self) -> Option<&Value> {
        match self.operation_type {
            OperationType::Delete => self
                .full_document_before_change
                .as_ref()
                .or(self.full_document.as_ref()),
            _ => self.full_document.as_ref(),
        }
    }
}

/// The durable resume unit, one per recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    #[serde(rename = "_id")]
    pub id: ResumeToken,
    pub timestamp: Timestamp,
    pub operation_type: OperationType,
    /// Kept for diagnostics and tests only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    /// Whether the dispatch pipeline completed for this event.
    #[serde(default)]
    pub delivered: bool,
}

impl CheckpointRecord {
    /// Copy with the delivered flag set.
    pub fn into_delivered(self) -> Self {
        Self {
            delivered: true,
            ..self
        }
    }
}

impl From<&ChangeEvent> for CheckpointRecord {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            id: event.id.clone(),
            timestamp: event.timestamp,
            operation_type: event.operation_type,
            full_document: event.full_document.clone(),
            delivered: false,
        }
    }
}

/// Where a change feed should start reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// Only events that happen after the cursor opens.
    Now,
    /// Strictly after the given token (needed after an invalidate).
    StartAfter(ResumeToken),
    /// From the given logical time, inclusive. Replays the checkpointed event.
    StartAtOperationTime(Timestamp),
}

impl StartPosition {
    /// Resolve the start position for an optional resume point.
    pub fn from_resume(resume: Option<&ResumePoint>) -> Self {
        resume.map_or(Self::Now, ResumePoint::start_position)
    }
}

/// Reference to the last durably recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub token: ResumeToken,
    pub timestamp: Timestamp,
    pub operation_type: OperationType,
    /// Whether the checkpointed event already made it through dispatch.
    pub delivered: bool,
}

impl ResumePoint {
    /// Invalidate checkpoints cannot be replayed by timestamp; doing so
    /// re-fetches the same invalidate event forever.
    pub fn requires_start_after(&self) -> bool {
        self.operation_type == OperationType::Invalidate
    }

    pub fn start_position(&self) -> StartPosition {
        if self.requires_start_after() {
            StartPosition::StartAfter(self.token.clone())
        } else {
            StartPosition::StartAtOperationTime(self.timestamp)
        }
    }
}

impl From<CheckpointRecord> for ResumePoint {
    fn from(record: CheckpointRecord) -> Self {
        Self {
            token: record.id,
            timestamp: record.timestamp,
            operation_type: record.operation_type,
            delivered: record.delivered,
        }
    }
}
