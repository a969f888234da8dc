//! JSON export and import of legacy `metadata.json` files.

use crate::error::DatabaseError;
use crate::types::{DownloadStatus, ImportStats};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::{Database, DownloadRecord};

/// One entry of a legacy metadata file, keyed by identifier
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyEntry {
    status: Option<String>,
    local_path: Option<String>,
    publisher: Option<String>,
    landing_url: Option<String>,
    pdf_url: Option<String>,
    sanitized_filename: Option<String>,
    error_reason: Option<String>,
    cloudflare_detected: bool,
    timestamp: Option<serde_json::Value>,
    first_attempted: Option<serde_json::Value>,
    last_attempted: Option<serde_json::Value>,
}

/// Unix seconds from a number or an RFC 3339 / naive ISO 8601 string
fn parse_timestamp(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp());
            }
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .ok()
                .map(|dt| dt.and_utc().timestamp())
        }
        _ => None,
    }
}

impl Database {
    /// Write every record to `path` as a pretty-printed JSON array
    ///
    /// Returns the number of records written.
    pub async fn export_to_json(&self, path: &Path) -> Result<usize> {
        let mut records = self.list_records(None).await?;
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        let json = serde_json::to_vec_pretty(&records)?;
        tokio::fs::write(path, json).await?;

        tracing::info!(records = records.len(), path = %path.display(), "Exported records");
        Ok(records.len())
    }

    /// Import a legacy `{identifier: {status, ...}}` metadata file
    ///
    /// Identifiers that already have a record are left untouched. Entries whose status
    /// cannot be read are counted as invalid. Successes are imported with
    /// `should_retry = true`, everything else as a retryable failure of one attempt.
    pub async fn import_from_metadata_json(&self, path: &Path) -> Result<ImportStats> {
        let content = tokio::fs::read_to_string(path).await?;
        let entries: BTreeMap<String, LegacyEntry> = serde_json::from_str(&content)?;

        let now = chrono::Utc::now().timestamp();
        let mut stats = ImportStats::default();

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        for (identifier, entry) in entries {
            let status = match entry.status.as_deref().unwrap_or("failure").parse::<DownloadStatus>() {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(identifier = %identifier, error = %e, "Skipping legacy entry");
                    stats.invalid += 1;
                    continue;
                }
            };

            let last_attempted = entry
                .last_attempted
                .as_ref()
                .or(entry.timestamp.as_ref())
                .and_then(parse_timestamp)
                .unwrap_or(now);
            let first_attempted = entry
                .first_attempted
                .as_ref()
                .and_then(parse_timestamp)
                .unwrap_or(last_attempted);

            let success = status == DownloadStatus::Success;
            let record = DownloadRecord {
                identifier,
                status,
                first_attempted,
                last_attempted,
                attempt_count: 1,
                should_retry: true,
                publisher: entry.publisher,
                strategy_used: None,
                landing_url: entry.landing_url,
                pdf_url: entry.pdf_url,
                sanitized_filename: entry.sanitized_filename,
                local_path: entry.local_path,
                file_size: None,
                file_exists: success,
                archived: false,
                archive_location: None,
                archive_date: None,
                error_reason: if success { None } else { entry.error_reason },
                cloudflare_detected: entry.cloudflare_detected,
                updated_at: now,
            };

            let result = sqlx::query(
                r#"
                INSERT INTO download_results (
                    identifier, status, first_attempted, last_attempted, attempt_count,
                    should_retry, publisher, landing_url, pdf_url, sanitized_filename,
                    local_path, file_exists, archived, error_reason, cloudflare_detected,
                    updated_at
                ) VALUES (?, ?, ?, ?, 1, 1, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
                ON CONFLICT(identifier) DO NOTHING
                "#,
            )
            .bind(&record.identifier)
            .bind(record.status)
            .bind(record.first_attempted)
            .bind(record.last_attempted)
            .bind(&record.publisher)
            .bind(&record.landing_url)
            .bind(&record.pdf_url)
            .bind(&record.sanitized_filename)
            .bind(&record.local_path)
            .bind(record.file_exists)
            .bind(&record.error_reason)
            .bind(record.cloudflare_detected)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to import record: {}",
                    e
                )))
            })?;

            if result.rows_affected() > 0 {
                stats.imported += 1;
            } else {
                stats.skipped_existing += 1;
            }
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit transaction: {}",
                e
            )))
        })?;

        tracing::info!(
            imported = stats.imported,
            skipped_existing = stats.skipped_existing,
            invalid = stats.invalid,
            "Imported legacy metadata"
        );

        Ok(stats)
    }
}
