// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collection setup for pre-image capture.
//!
//! [`ImageCaptureMode::Required`](crate::source::ImageCaptureMode::Required)
//! only works once the server records pre-images for the collection. Two
//! `collMod` flavours exist depending on server version:
//!
//! | Server | Command |
//! |--------|---------|
//! | 6.0+ | `changeStreamPreAndPostImages: { enabled: true }` |
//! | 5.x | `recordPreImages: true` |

use crate::error::{Result, WatchError};
use mongodb::bson::{doc, Document};
use mongodb::Database;
use tracing::info;

fn pre_and_post_images_command(collection: &str) -> Document {
    doc! {
        "collMod": collection,
        "changeStreamPreAndPostImages": { "enabled": true },
    }
}

fn record_pre_images_command(collection: &str) -> Document {
    doc! {
        "collMod": collection,
        "recordPreImages": true,
    }
}

async fn coll_mod(db: &Database, command: Document) -> Result<Document> {
    db.run_command(command)
        .await
        .map_err(|e| WatchError::feed("collMod", e))
}

/// Enable pre- and post-image capture (MongoDB 6.0+).
pub async fn enable_pre_post_images(db: &Database, collection: &str) -> Result<Document> {
    let reply = coll_mod(db, pre_and_post_images_command(collection)).await?;
    info!(database = %db.name(), collection, "Enabled changeStreamPreAndPostImages");
    Ok(reply)
}

/// Enable legacy pre-image recording (MongoDB 5.x).
pub async fn record_pre_images(db: &Database, collection: &str) -> Result<Document> {
    let reply = coll_mod(db, record_pre_images_command(collection)).await?;
    info!(database = %db.name(), collection, "Enabled recordPreImages");
    Ok(reply)
}
