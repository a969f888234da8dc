//! Database layer for pdf-fetch
//!
//! Handles SQLite persistence of per-identifier download metadata and the
//! persisted side of the postponement cache.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by concern:
//! - [`migrations`] - Database lifecycle, versioned schema migrations
//! - [`records`] - Recording attempts and administrative mutators
//! - [`eligibility`] - Retry-policy gating (`should_download`, `get_batch_status`)
//! - [`verify`] - Filesystem reconciliation and orphaned PDF discovery
//! - [`stats`] - Aggregate reporting
//! - [`merge`] - Merging another store into this one
//! - [`export`] - JSON export and legacy JSON import
//! - [`postponed`] - Postponement cache persistence

use crate::types::DownloadStatus;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;

mod eligibility;
mod export;
mod merge;
mod migrations;
mod postponed;
mod records;
mod stats;
mod verify;

pub use postponed::{PostponedKind, PostponedRow};

/// Columns selected whenever a full [`DownloadRecord`] is read
pub(crate) const RECORD_COLUMNS: &str = r#"
    identifier, status, first_attempted, last_attempted, attempt_count,
    should_retry, publisher, strategy_used, landing_url, pdf_url,
    sanitized_filename, local_path, file_size, file_exists, archived,
    archive_location, archive_date, error_reason, cloudflare_detected,
    updated_at
"#;

/// Metadata store backed by SQLite
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// One identifier's download history
#[derive(Debug, Clone, PartialEq, FromRow, serde::Serialize, serde::Deserialize)]
pub struct DownloadRecord {
    /// DOI, arXiv id or URL
    pub identifier: String,
    /// Last recorded outcome
    pub status: DownloadStatus,
    /// Unix timestamp of the first recorded attempt
    pub first_attempted: i64,
    /// Unix timestamp of the most recent recorded attempt
    pub last_attempted: i64,
    /// Attempts recorded since creation (or since the last manual reset)
    pub attempt_count: i64,
    /// False marks a permanent failure
    pub should_retry: bool,
    /// Publisher name
    pub publisher: Option<String>,
    /// Name of the strategy that produced the outcome
    pub strategy_used: Option<String>,
    /// Landing page URL
    pub landing_url: Option<String>,
    /// Direct PDF URL
    pub pdf_url: Option<String>,
    /// Filename the PDF was saved under
    pub sanitized_filename: Option<String>,
    /// Where the PDF was saved
    pub local_path: Option<String>,
    /// PDF size in bytes
    pub file_size: Option<i64>,
    /// Whether the file is believed to be on disk
    pub file_exists: bool,
    /// Whether the file was moved to cold storage
    pub archived: bool,
    /// Cold storage location
    pub archive_location: Option<String>,
    /// Unix timestamp of archiving
    pub archive_date: Option<i64>,
    /// Failure reason of the last attempt
    pub error_reason: Option<String>,
    /// Whether a Cloudflare challenge was seen on the last failure
    pub cloudflare_detected: bool,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

impl DownloadRecord {
    /// `last_attempted` as a UTC datetime
    pub fn last_attempted_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.last_attempted, 0).single()
    }

    /// `local_path` as a path
    pub fn local_path_buf(&self) -> Option<PathBuf> {
        self.local_path.as_ref().map(PathBuf::from)
    }
}

/// A successful download to be recorded
#[derive(Debug, Clone, Default)]
pub struct NewSuccess {
    /// Identifier the PDF belongs to
    pub identifier: String,
    /// Where the PDF was saved
    pub local_path: String,
    /// Publisher name (kept from the existing record when `None`)
    pub publisher: Option<String>,
    /// Strategy that produced the PDF
    pub strategy_used: Option<String>,
    /// Landing page URL (kept from the existing record when `None`)
    pub landing_url: Option<String>,
    /// Direct PDF URL
    pub pdf_url: Option<String>,
    /// Saved filename (kept from the existing record when `None`)
    pub sanitized_filename: Option<String>,
    /// PDF size in bytes
    pub file_size: Option<i64>,
}

impl NewSuccess {
    /// Success with only the mandatory fields set
    pub fn new(identifier: impl Into<String>, local_path: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            local_path: local_path.into(),
            ..Default::default()
        }
    }
}

/// A failed attempt to be recorded
#[derive(Debug, Clone)]
pub struct NewFailure {
    /// Identifier that failed
    pub identifier: String,
    /// Why it failed
    pub error_reason: String,
    /// Publisher name (kept from the existing record when `None`)
    pub publisher: Option<String>,
    /// Last strategy tried (kept from the existing record when `None`)
    pub strategy_used: Option<String>,
    /// Landing page URL (kept from the existing record when `None`)
    pub landing_url: Option<String>,
    /// PDF URL tried (kept from the existing record when `None`)
    pub pdf_url: Option<String>,
    /// Whether a Cloudflare challenge was seen
    pub cloudflare_detected: bool,
    /// False records a permanent failure
    pub should_retry: bool,
}

impl NewFailure {
    /// Retryable failure with only the mandatory fields set
    pub fn new(identifier: impl Into<String>, error_reason: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            error_reason: error_reason.into(),
            publisher: None,
            strategy_used: None,
            landing_url: None,
            pdf_url: None,
            cloudflare_detected: false,
            should_retry: true,
        }
    }

    /// Mark as permanent (never retried automatically)
    pub fn permanent(mut self) -> Self {
        self.should_retry = false;
        self
    }
}

/// Options for [`Database::merge_from`]
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Store to merge from
    pub source_db: PathBuf,
    /// Directory the source's PDFs live in (defaults to each record's own `local_path`)
    pub source_pdf_dir: Option<PathBuf>,
    /// Directory PDFs are relocated into (no relocation when `None`)
    pub target_pdf_dir: Option<PathBuf>,
    /// Move instead of copy
    pub move_files: bool,
    /// Compute statistics without writing anything
    pub dry_run: bool,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
