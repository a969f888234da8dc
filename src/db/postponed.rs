//! Persistence for the postponement cache.
//!
//! The in-memory cache is authoritative; these tables let blocks survive restarts.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

/// Which blocklist an entry belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostponedKind {
    /// Host names
    Domain,
    /// DOI registrant prefixes
    DoiPrefix,
    /// Individual identifiers
    Paper,
}

impl PostponedKind {
    /// All kinds, in filtering order
    pub const ALL: [PostponedKind; 3] = [
        PostponedKind::Paper,
        PostponedKind::DoiPrefix,
        PostponedKind::Domain,
    ];

    fn table(self) -> &'static str {
        match self {
            PostponedKind::Domain => "postponed_domains",
            PostponedKind::DoiPrefix => "postponed_doi_prefixes",
            PostponedKind::Paper => "postponed_papers",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            PostponedKind::Domain => "domain",
            PostponedKind::DoiPrefix => "prefix",
            PostponedKind::Paper => "identifier",
        }
    }
}

impl std::fmt::Display for PostponedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PostponedKind::Domain => "domain",
            PostponedKind::DoiPrefix => "doi_prefix",
            PostponedKind::Paper => "paper",
        };
        write!(f, "{}", s)
    }
}

/// A persisted postponement entry
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, serde::Serialize, serde::Deserialize)]
pub struct PostponedRow {
    /// Domain, prefix or identifier
    pub key: String,
    /// Why it was blocked
    pub reason: String,
    /// Unix timestamp of the first detection
    pub first_detected: i64,
    /// Unix timestamp of the most recent detection
    pub last_detected: i64,
    /// Number of detections
    pub detection_count: i64,
}

impl Database {
    /// All persisted entries of one kind
    pub async fn load_postponed(&self, kind: PostponedKind) -> Result<Vec<PostponedRow>> {
        let rows = sqlx::query_as::<_, PostponedRow>(&format!(
            "SELECT {} AS \"key\", reason, first_detected, last_detected, detection_count FROM {}",
            kind.key_column(),
            kind.table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load postponed {} entries: {}",
                kind, e
            )))
        })?;

        Ok(rows)
    }

    /// Insert an entry, or bump its detection count and refresh its reason
    pub async fn upsert_postponed(
        &self,
        kind: PostponedKind,
        key: &str,
        reason: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let column = kind.key_column();

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} ({column}, reason, first_detected, last_detected, detection_count)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT({column}) DO UPDATE SET
                reason = excluded.reason,
                last_detected = excluded.last_detected,
                detection_count = {table}.detection_count + 1
            "#,
            table = kind.table(),
            column = column,
        ))
        .bind(key)
        .bind(reason)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to persist postponed {}: {}",
                kind, e
            )))
        })?;

        Ok(())
    }

    /// Remove one entry; returns whether it existed
    pub async fn delete_postponed(&self, kind: PostponedKind, key: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = ?",
            kind.table(),
            kind.key_column()
        ))
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to delete postponed {}: {}",
                kind, e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every entry of every kind in one transaction
    pub async fn clear_postponed(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        for kind in PostponedKind::ALL {
            sqlx::query(&format!("DELETE FROM {}", kind.table()))
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to clear postponed {} entries: {}",
                        kind, e
                    )))
                })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit transaction: {}",
                e
            )))
        })?;

        Ok(())
    }
}
