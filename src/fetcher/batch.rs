//! Batch pipeline: pre-filter, sub-batches on a bounded worker pool, cancellation

use super::PdfFetcher;
use super::download::part_path;
use crate::error::Result;
use crate::postponed::TIMED_OUT_IN_BATCH;
use crate::retry::RetryDecision;
use crate::types::{BatchReport, BatchSummary, CacheAnalysis, FetchOutcome};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Reason given to identifiers left unprocessed by a cancellation
pub const INTERRUPTED_REASON: &str = "Interrupted before completion";

/// Reason given to identifiers removed by the postponement pre-filter
pub const POSTPONED_SKIP_REASON: &str =
    "Skipped: Domain/DOI prefix in postponed cache (known Cloudflare/access issues)";

/// Why a sub-batch stopped before every task finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Interrupted,
    TimedOut,
}

type TaskResult = (
    String,
    std::result::Result<Result<FetchOutcome>, Box<dyn Any + Send>>,
);

struct SubBatch {
    outcomes: Vec<FetchOutcome>,
    interrupted: bool,
}

impl PdfFetcher {
    /// Fetch many identifiers concurrently
    ///
    /// Identifiers go through the postponement pre-filter, then the store's
    /// batch eligibility check (skipped when `force` is set), then are fetched
    /// in sequential sub-batches of `fetch.sub_batch_size`, each on a pool of
    /// `fetch.max_workers` tasks. Failures of a finished sub-batch feed the
    /// postponement cache before the next one starts.
    ///
    /// Cancelling `cancel` abandons in-flight work: every identifier without an
    /// outcome yet is reported `postponed` with [`INTERRUPTED_REASON`] and is not
    /// written to the store. A sub-batch that outlives its wall-clock window is
    /// abandoned the same way with a "Timed out" reason.
    ///
    /// Duplicate and blank identifiers are dropped; every remaining identifier
    /// gets exactly one outcome.
    ///
    /// # Errors
    ///
    /// Only the up-front eligibility query can fail the whole batch; store
    /// errors while fetching become `failure` outcomes for that identifier.
    pub async fn fetch_batch(
        &self,
        identifiers: &[String],
        force: bool,
        cancel: CancellationToken,
    ) -> Result<BatchReport> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = identifiers
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();

        let mut outcomes: Vec<FetchOutcome> = Vec::with_capacity(unique.len());

        let candidates = if self.config.postponement.enabled {
            let partition = self.cache.filter_batch(&unique).await;
            for (identifier, reason) in partition.blocked {
                tracing::debug!(identifier = %identifier, reason = %reason, "Postponed by cache");
                outcomes.push(FetchOutcome::postponed(&identifier, POSTPONED_SKIP_REASON));
            }
            partition.processable
        } else {
            unique
        };
        let postponed_count = outcomes.len();

        let to_fetch = if force {
            candidates
        } else {
            let statuses = self
                .db
                .get_batch_status(
                    &candidates,
                    self.config.fetch.max_attempts,
                    self.config.fetch.min_retry_delay,
                )
                .await?;
            let mut to_fetch = Vec::with_capacity(candidates.len());
            for identifier in candidates {
                match statuses.get(&identifier) {
                    Some(RetryDecision::Deny(reason)) => {
                        outcomes.push(FetchOutcome::skipped(&identifier, Some(reason.clone())));
                    }
                    _ => to_fetch.push(identifier),
                }
            }
            to_fetch
        };

        tracing::info!(
            total = identifiers.len(),
            postponed = postponed_count,
            skipped = outcomes.len() - postponed_count,
            to_fetch = to_fetch.len(),
            "Starting batch"
        );

        let mut cache_analysis = CacheAnalysis::default();
        let mut interrupted = false;
        let sub_batch_size = self.config.fetch.sub_batch_size.max(1);
        let sub_batch_count = to_fetch.len().div_ceil(sub_batch_size);

        for (index, chunk) in to_fetch.chunks(sub_batch_size).enumerate() {
            if cancel.is_cancelled() {
                interrupted = true;
                outcomes.extend(
                    chunk
                        .iter()
                        .map(|id| FetchOutcome::postponed(id, INTERRUPTED_REASON)),
                );
                continue;
            }

            // Blocks learned from earlier sub-batches apply to later ones
            let chunk = if self.config.postponement.enabled && index > 0 {
                let partition = self.cache.filter_batch(chunk).await;
                for (identifier, reason) in partition.blocked {
                    tracing::debug!(identifier = %identifier, reason = %reason, "Postponed by cache");
                    outcomes.push(FetchOutcome::postponed(&identifier, POSTPONED_SKIP_REASON));
                }
                partition.processable
            } else {
                chunk.to_vec()
            };
            if chunk.is_empty() {
                continue;
            }

            tracing::info!(
                sub_batch = index + 1,
                of = sub_batch_count,
                size = chunk.len(),
                "Processing sub-batch"
            );
            let sub = self.run_sub_batch(&chunk, force, &cancel).await;
            interrupted |= sub.interrupted;

            if self.config.postponement.enabled {
                cache_analysis.absorb(self.cache.analyze_batch(&sub.outcomes).await);
            }
            outcomes.extend(sub.outcomes);
        }

        let summary = BatchSummary::from_outcomes(&outcomes);
        tracing::info!(
            success = summary.success,
            pre_existing = summary.pre_existing,
            skipped = summary.skipped,
            failure = summary.failure,
            postponed = summary.postponed,
            interrupted,
            "Batch complete"
        );

        Ok(BatchReport {
            outcomes,
            summary,
            cache_analysis,
            cancelled: interrupted,
        })
    }

    async fn run_sub_batch(
        &self,
        identifiers: &[String],
        force: bool,
        cancel: &CancellationToken,
    ) -> SubBatch {
        let window = self.config.fetch.sub_batch_timeout();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        let semaphore = Arc::new(Semaphore::new(self.config.fetch.max_workers.max(1)));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        for identifier in identifiers {
            let fetcher = self.clone();
            let identifier = identifier.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (identifier.clone(), Ok(Ok(FetchOutcome::postponed(&identifier, INTERRUPTED_REASON))));
                };
                let result = AssertUnwindSafe(fetcher.fetch_cancellable(&identifier, force, None, &cancel))
                    .catch_unwind()
                    .await;
                (identifier, result)
            });
        }

        let mut unresolved: HashSet<&str> = identifiers.iter().map(String::as_str).collect();
        let mut outcomes = Vec::with_capacity(identifiers.len());

        let stop = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some(Stop::Interrupted),
                _ = &mut deadline => break Some(Stop::TimedOut),
                joined = tasks.join_next() => match joined {
                    None => break None,
                    Some(Ok((identifier, result))) => {
                        unresolved.remove(identifier.as_str());
                        outcomes.push(settle(&identifier, result));
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Fetch task failed to join");
                    }
                },
            }
        };

        let Some(stop) = stop else {
            return SubBatch {
                outcomes,
                interrupted: false,
            };
        };

        // Tasks that finish while being aborted keep their real outcome
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((identifier, result)) = joined
                && unresolved.remove(identifier.as_str())
            {
                outcomes.push(settle(&identifier, result));
            }
        }
        for identifier in &unresolved {
            self.remove_partial_download(identifier).await;
        }

        let reason = match stop {
            Stop::Interrupted => INTERRUPTED_REASON.to_string(),
            Stop::TimedOut => format!("Timed out after {}s in batch", window.as_secs()),
        };
        tracing::warn!(
            abandoned = unresolved.len(),
            reason = %reason,
            "Abandoning unfinished fetches"
        );

        for identifier in identifiers.iter().filter(|id| unresolved.contains(id.as_str())) {
            if stop == Stop::TimedOut && self.config.postponement.enabled {
                self.cache.add_paper(identifier, TIMED_OUT_IN_BATCH).await;
            }
            outcomes.push(FetchOutcome::postponed(identifier, reason.clone()));
        }

        SubBatch {
            outcomes,
            interrupted: stop == Stop::Interrupted,
        }
    }
}

impl PdfFetcher {
    /// Delete the `.part` file an abandoned fetch may have left behind
    async fn remove_partial_download(&self, identifier: &str) {
        let Ok((_, dest)) = self.destination_for(identifier).await else {
            return;
        };
        let part = part_path(&dest);
        match tokio::fs::remove_file(&part).await {
            Ok(()) => tracing::debug!(identifier, path = %part.display(), "Removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %part.display(), error = %e, "Failed to remove partial download")
            }
        }
    }
}

/// Outcome for a finished task; store errors and panics become failures
fn settle(
    identifier: &str,
    result: std::result::Result<Result<FetchOutcome>, Box<dyn Any + Send>>,
) -> FetchOutcome {
    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::warn!(identifier, error = %e, "Fetch failed");
            FetchOutcome::failure(identifier, e.to_string())
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(identifier, panic = %message, "Fetch task panicked");
            FetchOutcome::failure(identifier, format!("Worker panicked: {}", message))
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::DownloadStatus;

    #[test]
    fn test_settle() {
        let ok = settle("a", Ok(Ok(FetchOutcome::skipped("a", None))));
        assert_eq!(ok.status, DownloadStatus::Skipped);

        let err = settle("b", Ok(Err(Error::Other("disk full".to_string()))));
        assert_eq!(err.status, DownloadStatus::Failure);
        assert_eq!(err.error_reason.as_deref(), Some("disk full"));

        let panicked = settle("c", Err(Box::new("boom")));
        assert_eq!(panicked.status, DownloadStatus::Failure);
        assert_eq!(
            panicked.error_reason.as_deref(),
            Some("Worker panicked: boom")
        );
    }
}
