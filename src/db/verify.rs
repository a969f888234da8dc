//! Reconciling stored records with the filesystem.

use crate::error::DatabaseError;
use crate::types::{ORPHAN_SCAN_STRATEGY, OrphanedPdf, VerifyReport};
use crate::utils::{infer_doi_from_filename, publisher_from_doi};
use crate::{Error, Result};
use std::collections::HashSet;
use std::path::Path;

use super::{Database, NewSuccess};

impl Database {
    /// Check every successful record's file on disk and correct `file_exists` drift
    ///
    /// Archived records are counted but not touched.
    pub async fn verify_files(&self) -> Result<VerifyReport> {
        let rows: Vec<(String, Option<String>, bool, bool)> = sqlx::query_as(
            r#"
            SELECT identifier, local_path, file_exists, archived
            FROM download_results
            WHERE status = 'success'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load records for verification: {}",
                e
            )))
        })?;

        let mut report = VerifyReport::default();
        let mut corrections: Vec<(String, bool)> = Vec::new();

        for (identifier, local_path, file_exists, archived) in rows {
            if archived {
                report.archived += 1;
                continue;
            }

            let on_disk = match &local_path {
                Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                None => false,
            };

            if on_disk {
                report.verified += 1;
            } else {
                report.missing += 1;
            }
            if on_disk != file_exists {
                corrections.push((identifier, on_disk));
            }
        }

        if !corrections.is_empty() {
            let now = chrono::Utc::now().timestamp();
            let mut tx = self.pool.begin().await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

            for (identifier, on_disk) in &corrections {
                sqlx::query(
                    "UPDATE download_results SET file_exists = ?, updated_at = ? WHERE identifier = ?",
                )
                .bind(on_disk)
                .bind(now)
                .bind(identifier)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to update file_exists: {}",
                        e
                    )))
                })?;
            }

            tx.commit().await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to commit transaction: {}",
                    e
                )))
            })?;
        }

        tracing::info!(
            verified = report.verified,
            missing = report.missing,
            archived = report.archived,
            corrected = corrections.len(),
            "File verification complete"
        );

        Ok(report)
    }

    /// PDFs in `dir` that no record refers to
    ///
    /// A file is considered known when its path or filename is stored on a record, or
    /// when the DOI inferred from its name already has a record.
    pub async fn scan_for_orphaned_pdfs(&self, dir: &Path) -> Result<Vec<OrphanedPdf>> {
        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT identifier, local_path, sanitized_filename FROM download_results",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load known files: {}",
                e
            )))
        })?;

        let mut known_identifiers = HashSet::new();
        let mut known_paths = HashSet::new();
        let mut known_names = HashSet::new();
        for (identifier, local_path, sanitized_filename) in rows {
            known_identifiers.insert(identifier);
            if let Some(path) = local_path {
                if let Some(name) = Path::new(&path).file_name() {
                    known_names.insert(name.to_string_lossy().into_owned());
                }
                known_paths.insert(path);
            }
            if let Some(name) = sanitized_filename {
                known_names.insert(name);
            }
        }

        let mut orphans = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_pdf = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
            if !is_pdf || !entry.file_type().await?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if known_paths.contains(path.to_string_lossy().as_ref()) || known_names.contains(&name)
            {
                continue;
            }

            let inferred_identifier = infer_doi_from_filename(&name);
            if let Some(doi) = &inferred_identifier
                && known_identifiers.contains(doi)
            {
                continue;
            }

            let size_bytes = entry.metadata().await?.len();
            orphans.push(OrphanedPdf {
                path,
                inferred_identifier,
                size_bytes,
            });
        }

        orphans.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::info!(dir = %dir.display(), orphans = orphans.len(), "Orphan scan complete");

        Ok(orphans)
    }

    /// Register an orphaned PDF as a successful download of `identifier`
    pub async fn add_orphaned_pdf(&self, path: &Path, identifier: &str) -> Result<()> {
        let metadata = tokio::fs::metadata(path).await?;

        let success = NewSuccess {
            publisher: Some(publisher_from_doi(identifier).to_string()),
            strategy_used: Some(ORPHAN_SCAN_STRATEGY.to_string()),
            sanitized_filename: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            file_size: Some(metadata.len() as i64),
            ..NewSuccess::new(identifier, path.to_string_lossy())
        };
        self.record_success(&success).await?;

        tracing::info!(identifier, path = %path.display(), "Registered orphaned PDF");
        Ok(())
    }
}
