//! Recording download attempts and administrative mutators.

use crate::error::DatabaseError;
use crate::types::DownloadStatus;
use crate::{Error, Result};

use super::{Database, DownloadRecord, NewFailure, NewSuccess, RECORD_COLUMNS};

impl Database {
    /// Get the record for an identifier
    pub async fn get(&self, identifier: &str) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query_as::<_, DownloadRecord>(&format!(
            "SELECT {} FROM download_results WHERE identifier = ?",
            RECORD_COLUMNS
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get record: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Another identifier whose record claims `filename` or `local_path`
    ///
    /// Distinct identifiers can sanitize to the same filename; the first one
    /// recorded keeps it.
    pub async fn file_owner(
        &self,
        filename: &str,
        local_path: &str,
        identifier: &str,
    ) -> Result<Option<String>> {
        let owner: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT identifier FROM download_results
            WHERE identifier != ? AND (sanitized_filename = ? OR local_path = ?)
            ORDER BY first_attempted, identifier
            LIMIT 1
            "#,
        )
        .bind(identifier)
        .bind(filename)
        .bind(local_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to look up file owner: {}",
                e
            )))
        })?;

        Ok(owner.map(|(identifier,)| identifier))
    }

    /// Record a successful download
    ///
    /// Inserts with `attempt_count = 1` or increments an existing record. A success
    /// always clears `error_reason` and restores `should_retry` and `file_exists`.
    pub async fn record_success(&self, success: &NewSuccess) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO download_results (
                identifier, status, first_attempted, last_attempted, attempt_count,
                should_retry, publisher, strategy_used, landing_url, pdf_url,
                sanitized_filename, local_path, file_size, file_exists, archived,
                error_reason, cloudflare_detected, updated_at
            ) VALUES (?, 'success', ?, ?, 1, 1, ?, ?, ?, ?, ?, ?, ?, 1, 0, NULL, 0, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                status = 'success',
                last_attempted = excluded.last_attempted,
                attempt_count = download_results.attempt_count + 1,
                should_retry = 1,
                publisher = COALESCE(excluded.publisher, download_results.publisher),
                strategy_used = excluded.strategy_used,
                landing_url = COALESCE(excluded.landing_url, download_results.landing_url),
                pdf_url = excluded.pdf_url,
                sanitized_filename = COALESCE(excluded.sanitized_filename, download_results.sanitized_filename),
                local_path = excluded.local_path,
                file_size = COALESCE(excluded.file_size, download_results.file_size),
                file_exists = 1,
                archived = 0,
                error_reason = NULL,
                cloudflare_detected = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&success.identifier)
        .bind(now)
        .bind(now)
        .bind(&success.publisher)
        .bind(&success.strategy_used)
        .bind(&success.landing_url)
        .bind(&success.pdf_url)
        .bind(&success.sanitized_filename)
        .bind(&success.local_path)
        .bind(success.file_size)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record success: {}",
                e
            )))
        })?;

        tracing::debug!(identifier = %success.identifier, "Recorded success");
        Ok(())
    }

    /// Record a failed attempt
    ///
    /// Inserts with `attempt_count = 1` or increments an existing record. A failure
    /// always leaves `file_exists = 0`.
    pub async fn record_failure(&self, failure: &NewFailure) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO download_results (
                identifier, status, first_attempted, last_attempted, attempt_count,
                should_retry, publisher, strategy_used, landing_url, pdf_url,
                file_exists, archived, error_reason, cloudflare_detected, updated_at
            ) VALUES (?, 'failure', ?, ?, 1, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                status = 'failure',
                last_attempted = excluded.last_attempted,
                attempt_count = download_results.attempt_count + 1,
                should_retry = excluded.should_retry,
                publisher = COALESCE(excluded.publisher, download_results.publisher),
                strategy_used = COALESCE(excluded.strategy_used, download_results.strategy_used),
                landing_url = COALESCE(excluded.landing_url, download_results.landing_url),
                pdf_url = COALESCE(excluded.pdf_url, download_results.pdf_url),
                file_exists = 0,
                error_reason = excluded.error_reason,
                cloudflare_detected = excluded.cloudflare_detected,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&failure.identifier)
        .bind(now)
        .bind(now)
        .bind(failure.should_retry)
        .bind(&failure.publisher)
        .bind(&failure.strategy_used)
        .bind(&failure.landing_url)
        .bind(&failure.pdf_url)
        .bind(&failure.error_reason)
        .bind(failure.cloudflare_detected)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record failure: {}",
                e
            )))
        })?;

        tracing::debug!(
            identifier = %failure.identifier,
            reason = %failure.error_reason,
            should_retry = failure.should_retry,
            "Recorded failure"
        );
        Ok(())
    }

    /// Mark a successful download as moved to cold storage
    ///
    /// Returns false if the identifier is unknown.
    pub async fn mark_archived(&self, identifier: &str, archive_location: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE download_results
            SET archived = 1, archive_location = ?, archive_date = ?, file_exists = 0, updated_at = ?
            WHERE identifier = ?
            "#,
        )
        .bind(archive_location)
        .bind(now)
        .bind(now)
        .bind(identifier)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark archived: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a record's file as no longer on disk
    ///
    /// Returns false if the identifier is unknown.
    pub async fn mark_file_missing(&self, identifier: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE download_results SET file_exists = 0, updated_at = ? WHERE identifier = ?",
        )
        .bind(now)
        .bind(identifier)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark file missing: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Make an identifier eligible again regardless of its history
    ///
    /// Resets `attempt_count` to 0 and `should_retry` to true. Unknown identifiers are a
    /// logged no-op and return false.
    pub async fn mark_for_retry(&self, identifier: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE download_results
            SET attempt_count = 0, should_retry = 1, updated_at = ?
            WHERE identifier = ?
            "#,
        )
        .bind(now)
        .bind(identifier)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark for retry: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            tracing::warn!(identifier, "Cannot mark for retry: identifier not found");
            return Ok(false);
        }

        tracing::info!(identifier, "Marked for retry");
        Ok(true)
    }

    /// Delete an identifier's record
    ///
    /// Returns whether a record was removed.
    pub async fn delete_entry(&self, identifier: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM download_results WHERE identifier = ?")
            .bind(identifier)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete record: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// List records, most recently attempted first
    pub async fn list_records(&self, status: Option<DownloadStatus>) -> Result<Vec<DownloadRecord>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, DownloadRecord>(&format!(
                    "SELECT {} FROM download_results WHERE status = ? ORDER BY last_attempted DESC, identifier",
                    RECORD_COLUMNS
                ))
                .bind(status)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, DownloadRecord>(&format!(
                    "SELECT {} FROM download_results ORDER BY last_attempted DESC, identifier",
                    RECORD_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list records: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Records whose files were moved to cold storage
    pub async fn get_archived(&self) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query_as::<_, DownloadRecord>(&format!(
            "SELECT {} FROM download_results WHERE archived = 1 ORDER BY archive_date DESC",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get archived records: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Successful, non-archived records whose file is gone
    pub async fn get_missing(&self) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query_as::<_, DownloadRecord>(&format!(
            r#"
            SELECT {} FROM download_results
            WHERE status = 'success' AND file_exists = 0 AND archived = 0
            ORDER BY last_attempted DESC
            "#,
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get missing records: {}",
                e
            )))
        })?;

        Ok(rows)
    }
}
