//! Retry-policy gating against stored records.

use crate::error::DatabaseError;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;

use super::{Database, DownloadRecord, RECORD_COLUMNS};

impl Database {
    /// Whether an identifier should be attempted, ignoring elapsed time
    pub async fn should_download(
        &self,
        identifier: &str,
        max_attempts: i64,
    ) -> Result<RetryDecision> {
        let record = self.get(identifier).await?;
        Ok(RetryPolicy::new(max_attempts).evaluate(record.as_ref()))
    }

    /// Decide a whole batch at once, additionally enforcing `min_retry_delay`
    ///
    /// Identifiers without a record are allowed. The answer for each identifier does not
    /// depend on the rest of the batch; duplicates collapse to one entry.
    pub async fn get_batch_status(
        &self,
        identifiers: &[String],
        max_attempts: i64,
        min_retry_delay: Duration,
    ) -> Result<HashMap<String, RetryDecision>> {
        let policy = RetryPolicy::new(max_attempts).with_min_retry_delay(min_retry_delay);
        let now = chrono::Utc::now().timestamp();

        let mut records: HashMap<String, DownloadRecord> = HashMap::new();

        // Stay well under SQLite's 999 bind variable limit
        const MAX_IDS_PER_QUERY: usize = 500;

        for chunk in identifiers.chunks(MAX_IDS_PER_QUERY) {
            let mut query_builder = sqlx::QueryBuilder::new(format!(
                "SELECT {} FROM download_results WHERE identifier IN (",
                RECORD_COLUMNS
            ));

            let mut separated = query_builder.separated(", ");
            for identifier in chunk {
                separated.push_bind(identifier);
            }
            separated.push_unseparated(")");

            let rows = query_builder
                .build_query_as::<DownloadRecord>()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to get batch status: {}",
                        e
                    )))
                })?;

            for row in rows {
                records.insert(row.identifier.clone(), row);
            }
        }

        let decisions = identifiers
            .iter()
            .map(|id| {
                let decision = policy.evaluate_at(records.get(id), now);
                (id.clone(), decision)
            })
            .collect();

        Ok(decisions)
    }
}
