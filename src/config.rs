// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a collection watch.
//!
//! Configuration can be constructed programmatically or deserialized from
//! JSON/YAML by the embedding process, then handed to
//! [`DocumentProcessor::from_config`](crate::processor::DocumentProcessor::from_config).
//!
//! # Quick Start
//!
//! ```rust
//! use change_watch::config::{TargetConfig, WatchConfig};
//!
//! let config = WatchConfig {
//!     target: TargetConfig::new("app", "users"),
//!     ..Default::default()
//! };
//! assert_eq!(config.checkpoint_collection_name(), "users_resume_points");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! WatchConfig
//! ├── target: TargetConfig          # database + collection to watch
//! ├── checkpoint: CheckpointConfig
//! │   ├── backend: sqlite { path } | mongo { database }
//! │   └── suffix: String            # keeps parallel watches apart
//! ├── capture: off | update_lookup | required
//! └── backoff: BackoffConfig        # humantime strings
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! target:
//!   database: "app"
//!   collection: "users"
//!
//! checkpoint:
//!   backend:
//!     mongo:
//!       database: "app_local"
//!   suffix: "_billing"
//!
//! capture: required
//!
//! backoff:
//!   initial_interval: "500ms"
//!   max_interval: "1m"
//!   multiplier: 1.5
//! ```

use crate::checkpoint::mongo_resume_collection_name;
use crate::error::{Result, WatchError};
use crate::source::ImageCaptureMode;
use crate::supervisor::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to watch one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Collection whose changes are consumed.
    pub target: TargetConfig,

    /// Where resume checkpoints are kept.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Which document images the change stream attaches.
    #[serde(default)]
    pub capture: ImageCaptureMode,

    /// Retry behaviour of the supervisor.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl WatchConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| WatchError::Config(format!("Invalid watch config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.target.database.trim().is_empty() {
            return Err(WatchError::Config("target.database must not be empty".into()));
        }
        if self.target.collection.trim().is_empty() {
            return Err(WatchError::Config("target.collection must not be empty".into()));
        }
        match &self.checkpoint.backend {
            CheckpointBackend::Sqlite { path } if path.as_os_str().is_empty() => {
                return Err(WatchError::Config("checkpoint sqlite path must not be empty".into()));
            }
            CheckpointBackend::Mongo { database } if database.trim().is_empty() => {
                return Err(WatchError::Config("checkpoint database must not be empty".into()));
            }
            _ => {}
        }
        if self.backoff.multiplier.is_nan() || self.backoff.multiplier < 1.0 {
            return Err(WatchError::Config(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                self.backoff.multiplier
            )));
        }
        Ok(())
    }

    /// Name of the MongoDB checkpoint collection for this watch.
    pub fn checkpoint_collection_name(&self) -> String {
        mongo_resume_collection_name(&self.target.collection, &self.checkpoint.suffix)
    }

    /// Key that separates this watch's records in a shared SQLite file.
    pub fn watch_id(&self) -> String {
        format!(
            "{}.{}{}",
            self.target.database, self.target.collection, self.checkpoint.suffix
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TargetConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Database and collection being watched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    pub database: String,
    pub collection: String,
}

impl TargetConfig {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    /// Local SQLite file (WAL mode).
    Sqlite { path: PathBuf },
    /// `<collection><suffix>_resume_points` in this MongoDB database.
    Mongo { database: String },
}

impl Default for CheckpointBackend {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from(default_sqlite_path()),
        }
    }
}

fn default_sqlite_path() -> String {
    "change_watch_checkpoints.db".to_string()
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,

    /// Appended to the collection name. Use a distinct suffix per processor
    /// when several processors watch the same collection.
    #[serde(default)]
    pub suffix: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackoffConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Supervisor backoff, with durations as humantime strings ("500ms", "1m").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_interval")]
    pub initial_interval: String,

    #[serde(default = "default_max_interval")]
    pub max_interval: String,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Unset = retry forever.
    #[serde(default)]
    pub max_elapsed_time: Option<String>,

    /// Unset = retry forever.
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

fn default_initial_interval() -> String {
    "500ms".to_string()
}

fn default_max_interval() -> String {
    "60s".to_string()
}

fn default_multiplier() -> f64 {
    1.5
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            multiplier: default_multiplier(),
            max_elapsed_time: None,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    pub fn initial_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.initial_interval).unwrap_or(Duration::from_millis(500))
    }

    pub fn max_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_interval).unwrap_or(Duration::from_secs(60))
    }

    /// `None` when unset or unparseable.
    pub fn max_elapsed_time_duration(&self) -> Option<Duration> {
        self.max_elapsed_time
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }

    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: self.initial_interval_duration(),
            multiplier: self.multiplier,
            max_interval: self.max_interval_duration(),
            max_elapsed_time: self.max_elapsed_time_duration(),
            max_attempts: self.max_attempts,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
