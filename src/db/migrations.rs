//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // WAL lets worker tasks read while one writes
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };

        db.run_migrations().await?;

        Ok(db)
    }

    /// Open an existing store without creating it (used as a merge source)
    pub(crate) async fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "Database file not found: {}",
                path.display()
            ))));
        }
        Self::new(path).await
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::begin(&mut conn, 1).await?;
            let result = async {
                Self::migrate_v1(&mut conn).await?;
                Self::record_migration(&mut conn, 1).await
            }
            .await;
            Self::finish(&mut conn, 1, result).await?;
        }
        if current_version < 2 {
            Self::begin(&mut conn, 2).await?;
            let result = async {
                Self::migrate_v2(&mut conn).await?;
                Self::record_migration(&mut conn, 2).await
            }
            .await;
            Self::finish(&mut conn, 2, result).await?;
        }
        if current_version < 3 {
            Self::begin(&mut conn, 3).await?;
            let result = async {
                Self::migrate_v3(&mut conn).await?;
                Self::record_migration(&mut conn, 3).await
            }
            .await;
            Self::finish(&mut conn, 3, result).await?;
        }

        Ok(())
    }

    /// Open the transaction a migration step runs in
    async fn begin(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        tracing::info!(version, "Applying database migration");

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;
        Ok(())
    }

    /// Commit a migration step, or roll it back if it failed
    async fn finish(conn: &mut SqliteConnection, version: i32, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v{}: {}",
                            version, e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!(version, "Database migration complete");
        Ok(())
    }

    /// Migration v1: download_results table and its indexes
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS download_results (
                identifier TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                first_attempted INTEGER NOT NULL,
                last_attempted INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 1,
                should_retry INTEGER NOT NULL DEFAULT 1,
                publisher TEXT,
                strategy_used TEXT,
                landing_url TEXT,
                pdf_url TEXT,
                sanitized_filename TEXT,
                local_path TEXT,
                file_exists INTEGER NOT NULL DEFAULT 1,
                archived INTEGER NOT NULL DEFAULT 0,
                archive_location TEXT,
                archive_date INTEGER,
                error_reason TEXT,
                cloudflare_detected INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create download_results table: {}",
                e
            )))
        })?;

        for (name, column) in [
            ("idx_results_status", "status"),
            ("idx_results_should_retry", "should_retry"),
            ("idx_results_publisher", "publisher"),
            ("idx_results_last_attempted", "last_attempted"),
            ("idx_results_archived", "archived"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON download_results({})",
                name, column
            ))
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to create index {}: {}",
                    name, e
                )))
            })?;
        }

        Ok(())
    }

    /// Migration v2: postponement cache tables
    async fn migrate_v2(conn: &mut SqliteConnection) -> Result<()> {
        for (table, key) in [
            ("postponed_domains", "domain"),
            ("postponed_doi_prefixes", "prefix"),
            ("postponed_papers", "identifier"),
        ] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    {key} TEXT PRIMARY KEY,
                    reason TEXT NOT NULL,
                    first_detected INTEGER NOT NULL,
                    last_detected INTEGER NOT NULL,
                    detection_count INTEGER NOT NULL DEFAULT 1
                )
                "#
            ))
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to create {} table: {}",
                    table, e
                )))
            })?;
        }

        Ok(())
    }

    /// Migration v3: record the size of stored PDFs
    ///
    /// Existing rows keep their data and get NULL for the new column.
    async fn migrate_v3(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("ALTER TABLE download_results ADD COLUMN file_size INTEGER")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to add file_size column: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Record that a migration has been applied
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    version, e
                )))
            })?;
        Ok(())
    }

    /// Highest applied schema version
    pub async fn schema_version(&self) -> Result<i64> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to query schema version: {}",
                    e
                )))
            })?;
        Ok(version.unwrap_or(0))
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
