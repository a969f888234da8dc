//! Merging an independently grown store into this one.

use crate::error::DatabaseError;
use crate::types::{DownloadStatus, MergeStats};
use crate::{Error, Result};
use std::path::{Path, PathBuf};

use super::{Database, DownloadRecord, MergeOptions, RECORD_COLUMNS};

/// What to do with one source record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MergeAction {
    Add,
    SuccessOverFailure,
    Newer,
    KeepExistingSuccess,
    KeepExisting,
}

impl MergeAction {
    fn writes(self) -> bool {
        matches!(
            self,
            MergeAction::Add | MergeAction::SuccessOverFailure | MergeAction::Newer
        )
    }
}

/// Conflict policy: success beats non-success; otherwise the strictly newer attempt wins
fn resolve(source: &DownloadRecord, existing: Option<&DownloadRecord>) -> MergeAction {
    let Some(existing) = existing else {
        return MergeAction::Add;
    };

    let source_ok = source.status == DownloadStatus::Success;
    let existing_ok = existing.status == DownloadStatus::Success;

    match (source_ok, existing_ok) {
        (true, false) => MergeAction::SuccessOverFailure,
        (false, true) => MergeAction::KeepExistingSuccess,
        _ => {
            // Missing or corrupt timestamps count as oldest
            let source_time = source.last_attempted.max(0);
            let existing_time = existing.last_attempted.max(0);
            if source_time > existing_time {
                MergeAction::Newer
            } else {
                MergeAction::KeepExisting
            }
        }
    }
}

enum FileMove {
    Moved(PathBuf),
    Copied(PathBuf),
    Skipped(PathBuf),
}

impl Database {
    /// Merge the store at `options.source_db` into this one
    ///
    /// Per-record failures are logged and counted in [`MergeStats::errors`]; the merge
    /// carries on with the next record. With `dry_run`, nothing is written or moved.
    pub async fn merge_from(&self, options: &MergeOptions) -> Result<MergeStats> {
        let source = Database::open_existing(&options.source_db).await?;

        let source_records = sqlx::query_as::<_, DownloadRecord>(&format!(
            "SELECT {} FROM download_results ORDER BY identifier",
            RECORD_COLUMNS
        ))
        .fetch_all(&source.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read source records: {}",
                e
            )))
        });
        source.close().await;
        let source_records = source_records?;

        tracing::info!(
            source = %options.source_db.display(),
            entries = source_records.len(),
            dry_run = options.dry_run,
            "Merging metadata store"
        );

        let mut stats = MergeStats {
            total_source_entries: source_records.len(),
            ..Default::default()
        };

        let mut tx = if options.dry_run {
            None
        } else {
            Some(self.pool.begin().await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?)
        };

        for mut record in source_records {
            let existing = match self.get(&record.identifier).await {
                Ok(existing) => existing,
                Err(e) => {
                    tracing::warn!(identifier = %record.identifier, error = %e, "Merge lookup failed");
                    stats.errors += 1;
                    continue;
                }
            };

            let action = resolve(&record, existing.as_ref());
            match action {
                MergeAction::Add => stats.added += 1,
                MergeAction::SuccessOverFailure => {
                    stats.updated += 1;
                    stats.conflicts_resolved += 1;
                }
                MergeAction::Newer => stats.updated += 1,
                MergeAction::KeepExistingSuccess | MergeAction::KeepExisting => {
                    stats.kept_existing += 1
                }
            }

            tracing::debug!(identifier = %record.identifier, ?action, "Merge decision");

            let Some(tx) = tx.as_mut() else {
                continue;
            };
            if !action.writes() {
                continue;
            }

            if record.status == DownloadStatus::Success
                && let Some(target_dir) = &options.target_pdf_dir
                && let Some(source_pdf) = locate_source_pdf(&record, options)
            {
                match relocate(&source_pdf, target_dir, options.move_files).await {
                    Ok(FileMove::Moved(path)) => {
                        stats.files_moved += 1;
                        record.local_path = Some(path.to_string_lossy().into_owned());
                    }
                    Ok(FileMove::Copied(path)) => {
                        stats.files_copied += 1;
                        record.local_path = Some(path.to_string_lossy().into_owned());
                    }
                    Ok(FileMove::Skipped(path)) => {
                        stats.files_skipped += 1;
                        record.local_path = Some(path.to_string_lossy().into_owned());
                    }
                    Err(e) => {
                        tracing::error!(
                            identifier = %record.identifier,
                            file = %source_pdf.display(),
                            error = %e,
                            "Failed to relocate PDF"
                        );
                        stats.errors += 1;
                    }
                }
            }

            if let Err(e) = write_merged(&mut **tx, &record).await {
                tracing::warn!(identifier = %record.identifier, error = %e, "Failed to write merged record");
                stats.errors += 1;
            }
        }

        if let Some(tx) = tx {
            tx.commit().await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to commit merge: {}",
                    e
                )))
            })?;
        }

        tracing::info!(
            added = stats.added,
            updated = stats.updated,
            kept_existing = stats.kept_existing,
            files_moved = stats.files_moved,
            files_copied = stats.files_copied,
            files_skipped = stats.files_skipped,
            errors = stats.errors,
            "Merge complete"
        );

        Ok(stats)
    }
}

/// Where a source record's PDF lives on disk
///
/// `source_pdf_dir` wins; otherwise relative paths resolve against the source store's
/// directory.
fn locate_source_pdf(record: &DownloadRecord, options: &MergeOptions) -> Option<PathBuf> {
    let stored = PathBuf::from(record.local_path.as_ref()?);

    let path = match &options.source_pdf_dir {
        Some(dir) => dir.join(stored.file_name()?),
        None if stored.is_relative() => options
            .source_db
            .parent()
            .map(|parent| parent.join(&stored))
            .unwrap_or(stored),
        None => stored,
    };
    Some(path)
}

/// Move or copy `source` into `target_dir`, keeping its filename
async fn relocate(source: &Path, target_dir: &Path, move_files: bool) -> Result<FileMove> {
    let name = source.file_name().ok_or_else(|| {
        Error::Other(format!("PDF path has no filename: {}", source.display()))
    })?;
    let target = target_dir.join(name);

    if !tokio::fs::try_exists(source).await.unwrap_or(false) {
        tracing::warn!(file = %source.display(), "Source PDF not found");
        return Ok(FileMove::Skipped(target));
    }

    let same_file = match (
        tokio::fs::canonicalize(source).await,
        tokio::fs::canonicalize(&target).await,
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if same_file {
        return Ok(FileMove::Skipped(target));
    }

    tokio::fs::create_dir_all(target_dir).await?;

    if move_files {
        // rename fails across filesystems
        if tokio::fs::rename(source, &target).await.is_err() {
            tokio::fs::copy(source, &target).await?;
            tokio::fs::remove_file(source).await?;
        }
        tracing::info!(file = %target.display(), "Moved PDF");
        Ok(FileMove::Moved(target))
    } else {
        tokio::fs::copy(source, &target).await?;
        tracing::info!(file = %target.display(), "Copied PDF");
        Ok(FileMove::Copied(target))
    }
}

async fn write_merged(
    conn: &mut sqlx::SqliteConnection,
    record: &DownloadRecord,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO download_results (
            identifier, status, first_attempted, last_attempted, attempt_count,
            should_retry, publisher, strategy_used, landing_url, pdf_url,
            sanitized_filename, local_path, file_size, file_exists, archived,
            archive_location, archive_date, error_reason, cloudflare_detected,
            updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.identifier)
    .bind(record.status)
    .bind(record.first_attempted)
    .bind(record.last_attempted)
    .bind(record.attempt_count)
    .bind(record.should_retry)
    .bind(&record.publisher)
    .bind(&record.strategy_used)
    .bind(&record.landing_url)
    .bind(&record.pdf_url)
    .bind(&record.sanitized_filename)
    .bind(&record.local_path)
    .bind(record.file_size)
    .bind(record.file_exists)
    .bind(record.archived)
    .bind(&record.archive_location)
    .bind(record.archive_date)
    .bind(&record.error_reason)
    .bind(record.cloudflare_detected)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Failed to write merged record: {}",
            e
        )))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: DownloadStatus, last_attempted: i64) -> DownloadRecord {
        DownloadRecord {
            identifier: "10.1234/x".to_string(),
            status,
            first_attempted: last_attempted,
            last_attempted,
            attempt_count: 1,
            should_retry: true,
            publisher: None,
            strategy_used: None,
            landing_url: None,
            pdf_url: None,
            sanitized_filename: None,
            local_path: None,
            file_size: None,
            file_exists: false,
            archived: false,
            archive_location: None,
            archive_date: None,
            error_reason: None,
            cloudflare_detected: false,
            updated_at: last_attempted,
        }
    }

    #[test]
    fn test_success_always_wins() {
        let success = record(DownloadStatus::Success, 1);
        let failure = record(DownloadStatus::Failure, 1_000_000);

        assert_eq!(
            resolve(&success, Some(&failure)),
            MergeAction::SuccessOverFailure
        );
        assert_eq!(
            resolve(&failure, Some(&success)),
            MergeAction::KeepExistingSuccess
        );
    }

    #[test]
    fn test_same_status_newer_wins() {
        let older = record(DownloadStatus::Failure, 100);
        let newer = record(DownloadStatus::Failure, 200);

        assert_eq!(resolve(&newer, Some(&older)), MergeAction::Newer);
        assert_eq!(resolve(&older, Some(&newer)), MergeAction::KeepExisting);
        assert_eq!(resolve(&older, Some(&older)), MergeAction::KeepExisting);
    }

    #[test]
    fn test_invalid_source_timestamp_counts_as_oldest() {
        let corrupt = record(DownloadStatus::Failure, -5);
        let existing = record(DownloadStatus::Failure, 0);
        assert_eq!(resolve(&corrupt, Some(&existing)), MergeAction::KeepExisting);
    }

    #[test]
    fn test_new_identifier_added() {
        assert_eq!(
            resolve(&record(DownloadStatus::Failure, 1), None),
            MergeAction::Add
        );
    }
}
