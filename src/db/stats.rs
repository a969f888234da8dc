//! Aggregate reporting over the metadata store.

use crate::error::DatabaseError;
use crate::types::{DownloadStatus, RetryStats, StatusCounts, StoreStats};
use crate::{Error, Result};
use std::collections::BTreeMap;

use super::Database;

const DAY_SECS: i64 = 24 * 60 * 60;

fn query_failed(what: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!(
        "Failed to {}: {}",
        what, e
    )))
}

impl Database {
    /// Counts by status, publisher, strategy and error reason
    pub async fn get_stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        let by_status: Vec<(DownloadStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM download_results GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| query_failed("count records by status", e))?;
        for (status, count) in by_status {
            stats.by_status.add(status, count);
        }
        stats.total = stats.by_status.total();
        if stats.total > 0 {
            stats.success_rate = stats.by_status.success as f64 / stats.total as f64 * 100.0;
        }

        let (archived, missing, avg_attempts): (i64, i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN archived = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'success' AND file_exists = 0 AND archived = 0 THEN 1 ELSE 0 END), 0),
                AVG(attempt_count)
            FROM download_results
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("compute file statistics", e))?;
        stats.archived = archived;
        stats.missing = missing;
        stats.avg_attempts = avg_attempts.unwrap_or(0.0);

        let by_publisher: Vec<(String, DownloadStatus, i64)> = sqlx::query_as(
            r#"
            SELECT publisher, status, COUNT(*)
            FROM download_results
            WHERE publisher IS NOT NULL
            GROUP BY publisher, status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("count records by publisher", e))?;
        stats.by_publisher = group_counts(by_publisher);

        let mut top: Vec<(String, i64)> = stats
            .by_publisher
            .iter()
            .map(|(name, counts)| (name.clone(), counts.total()))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(10);
        stats.top_publishers = top;

        let since = chrono::Utc::now().timestamp() - 7 * DAY_SECS;
        stats.recent_activity = sqlx::query_as(
            r#"
            SELECT date(last_attempted, 'unixepoch') AS day, COUNT(*)
            FROM download_results
            WHERE last_attempted >= ?
            GROUP BY day
            ORDER BY day DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("compute recent activity", e))?;

        stats.error_reasons = sqlx::query_as(
            r#"
            SELECT error_reason, COUNT(*) AS count
            FROM download_results
            WHERE status = 'failure' AND error_reason IS NOT NULL
            GROUP BY error_reason
            ORDER BY count DESC, error_reason
            LIMIT 10
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("count error reasons", e))?;

        let by_strategy: Vec<(String, DownloadStatus, i64)> = sqlx::query_as(
            r#"
            SELECT strategy_used, status, COUNT(*)
            FROM download_results
            WHERE strategy_used IS NOT NULL
            GROUP BY strategy_used, status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("count records by strategy", e))?;
        stats.strategy_stats = group_counts(by_strategy);

        Ok(stats)
    }

    /// How many failures will be retried, and how soon
    ///
    /// `retry_1_day` and `retry_1_week` count retryable failures last attempted within
    /// that window.
    pub async fn get_retry_stats(&self, max_attempts: i64) -> Result<RetryStats> {
        let now = chrono::Utc::now().timestamp();

        let (total_retry, retry_1_day, retry_1_week, never_retry, max_attempts_reached): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN should_retry = 1 AND attempt_count < ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN should_retry = 1 AND attempt_count < ?1 AND last_attempted >= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN should_retry = 1 AND attempt_count < ?1 AND last_attempted >= ?3 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN should_retry = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN attempt_count >= ?1 THEN 1 ELSE 0 END), 0)
            FROM download_results
            WHERE status = 'failure'
            "#,
        )
        .bind(max_attempts)
        .bind(now - DAY_SECS)
        .bind(now - 7 * DAY_SECS)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("compute retry statistics", e))?;

        Ok(RetryStats {
            total_retry,
            retry_1_day,
            retry_1_week,
            never_retry,
            max_attempts_reached,
            summary: format!(
                "{} papers will retry within 1 day, {} within 1 week (out of {} retryable papers)",
                retry_1_day, retry_1_week, total_retry
            ),
        })
    }
}

fn group_counts(rows: Vec<(String, DownloadStatus, i64)>) -> BTreeMap<String, StatusCounts> {
    let mut grouped: BTreeMap<String, StatusCounts> = BTreeMap::new();
    for (key, status, count) in rows {
        grouped.entry(key).or_default().add(status, count);
    }
    grouped
}
