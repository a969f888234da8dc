//! Core types for pdf-fetch

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Provenance recorded when a PDF already on disk is registered instead of downloaded
pub const PRE_EXISTING_STRATEGY: &str = "PreExistingFile";

/// Provenance recorded for PDFs adopted by an orphan scan
pub const ORPHAN_SCAN_STRATEGY: &str = "OrphanScan";

/// Outcome category of one identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// PDF downloaded (or registered) and stored
    Success,
    /// Attempted and failed
    Failure,
    /// Not attempted now, or failed transiently; expected to self-heal
    Postponed,
    /// Not attempted because the store says it is resolved or not yet eligible
    Skipped,
}

impl DownloadStatus {
    /// Lowercase name as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Success => "success",
            DownloadStatus::Failure => "failure",
            DownloadStatus::Postponed => "postponed",
            DownloadStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(DownloadStatus::Success),
            "failure" => Ok(DownloadStatus::Failure),
            "postponed" => Ok(DownloadStatus::Postponed),
            "skipped" => Ok(DownloadStatus::Skipped),
            other => Err(format!("unknown download status: {}", other)),
        }
    }
}

// Stored as TEXT
impl sqlx::Type<sqlx::Sqlite> for DownloadStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for DownloadStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode(self.as_str().to_string(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for DownloadStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Result of processing one identifier, as surfaced to callers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    /// The identifier this outcome belongs to
    pub identifier: String,
    /// Outcome category
    pub status: DownloadStatus,
    /// Why it did not succeed (or why it was skipped)
    pub error_reason: Option<String>,
    /// Where the PDF was stored
    pub local_path: Option<PathBuf>,
    /// Name of the strategy that produced the PDF (or the last one tried)
    pub strategy_used: Option<String>,
    /// Publisher inferred from the DOI prefix
    pub publisher: Option<String>,
}

impl FetchOutcome {
    fn new(identifier: &str, status: DownloadStatus) -> Self {
        Self {
            identifier: identifier.to_string(),
            status,
            error_reason: None,
            local_path: None,
            strategy_used: None,
            publisher: None,
        }
    }

    /// A stored PDF
    pub fn success(
        identifier: &str,
        local_path: PathBuf,
        strategy_used: &str,
        publisher: Option<String>,
    ) -> Self {
        Self {
            local_path: Some(local_path),
            strategy_used: Some(strategy_used.to_string()),
            publisher,
            ..Self::new(identifier, DownloadStatus::Success)
        }
    }

    /// An attempted, failed fetch
    pub fn failure(identifier: &str, reason: impl Into<String>) -> Self {
        Self {
            error_reason: Some(reason.into()),
            ..Self::new(identifier, DownloadStatus::Failure)
        }
    }

    /// A deferred identifier
    pub fn postponed(identifier: &str, reason: impl Into<String>) -> Self {
        Self {
            error_reason: Some(reason.into()),
            ..Self::new(identifier, DownloadStatus::Postponed)
        }
    }

    /// An identifier the store says not to fetch
    pub fn skipped(identifier: &str, reason: Option<String>) -> Self {
        Self {
            error_reason: reason,
            ..Self::new(identifier, DownloadStatus::Skipped)
        }
    }

    /// Attach the strategy that was last tried
    pub fn with_strategy(mut self, strategy: Option<&str>) -> Self {
        self.strategy_used = strategy.map(str::to_string);
        self
    }

    /// Attach a publisher name
    pub fn with_publisher(mut self, publisher: Option<String>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Success that came from a file already on disk
    pub fn is_pre_existing(&self) -> bool {
        self.status == DownloadStatus::Success
            && self.strategy_used.as_deref() == Some(PRE_EXISTING_STRATEGY)
    }
}

/// Success/total tally for one publisher
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherTally {
    /// Successful outcomes
    pub success: usize,
    /// All attempted outcomes
    pub total: usize,
}

impl PublisherTally {
    /// Fraction of attempted outcomes that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 / self.total as f64
        }
    }
}

/// Per-category counts of a batch run plus the breakdowns an operator asks for
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Newly downloaded
    pub success: usize,
    /// Registered from files already present
    pub pre_existing: usize,
    /// Skipped by retry policy
    pub skipped: usize,
    /// Failed
    pub failure: usize,
    /// Postponed (blocked, transient failure, interrupted or timed out)
    pub postponed: usize,
    /// Failure/postponement reasons with their frequency
    pub error_reasons: BTreeMap<String, usize>,
    /// Success rate inputs per publisher (attempted outcomes only)
    pub publishers: BTreeMap<String, PublisherTally>,
}

impl BatchSummary {
    /// Summarise a set of outcomes; order does not matter
    pub fn from_outcomes(outcomes: &[FetchOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome.status {
                DownloadStatus::Success if outcome.is_pre_existing() => summary.pre_existing += 1,
                DownloadStatus::Success => summary.success += 1,
                DownloadStatus::Skipped => summary.skipped += 1,
                DownloadStatus::Failure => summary.failure += 1,
                DownloadStatus::Postponed => summary.postponed += 1,
            }

            if matches!(
                outcome.status,
                DownloadStatus::Failure | DownloadStatus::Postponed
            ) && let Some(reason) = &outcome.error_reason
            {
                *summary.error_reasons.entry(reason.clone()).or_default() += 1;
            }

            if let Some(publisher) = &outcome.publisher
                && matches!(
                    outcome.status,
                    DownloadStatus::Success | DownloadStatus::Failure
                )
            {
                let tally = summary.publishers.entry(publisher.clone()).or_default();
                tally.total += 1;
                if outcome.status == DownloadStatus::Success {
                    tally.success += 1;
                }
            }
        }
        summary
    }

    /// Total outcomes counted
    pub fn total(&self) -> usize {
        self.success + self.pre_existing + self.skipped + self.failure + self.postponed
    }
}

/// What one postponement-cache analysis pass added
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheAnalysis {
    /// Newly blocked domains
    pub domains_added: usize,
    /// Newly blocked DOI prefixes
    pub prefixes_added: usize,
    /// Blocked domains after the pass
    pub total_domains: usize,
    /// Blocked DOI prefixes after the pass
    pub total_prefixes: usize,
}

impl CacheAnalysis {
    /// Fold another pass into this one, keeping the latest totals
    pub fn absorb(&mut self, other: CacheAnalysis) {
        self.domains_added += other.domains_added;
        self.prefixes_added += other.prefixes_added;
        self.total_domains = other.total_domains;
        self.total_prefixes = other.total_prefixes;
    }
}

/// Result of [`PdfFetcher::fetch_batch`](crate::PdfFetcher::fetch_batch)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchReport {
    /// One outcome per input identifier, in completion order
    pub outcomes: Vec<FetchOutcome>,
    /// Counts and breakdowns
    pub summary: BatchSummary,
    /// Postponement cache changes made from this batch's failures
    pub cache_analysis: CacheAnalysis,
    /// Whether the run was cancelled before every identifier was processed
    pub cancelled: bool,
}

impl BatchReport {
    /// Outcome for one identifier
    pub fn outcome(&self, identifier: &str) -> Option<&FetchOutcome> {
        self.outcomes.iter().find(|o| o.identifier == identifier)
    }
}

/// Counts of records by status
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Successful records
    pub success: i64,
    /// Failed records
    pub failure: i64,
    /// Postponed records
    pub postponed: i64,
    /// Skipped records
    pub skipped: i64,
}

impl StatusCounts {
    /// Add `count` to the bucket for `status`
    pub fn add(&mut self, status: DownloadStatus, count: i64) {
        match status {
            DownloadStatus::Success => self.success += count,
            DownloadStatus::Failure => self.failure += count,
            DownloadStatus::Postponed => self.postponed += count,
            DownloadStatus::Skipped => self.skipped += count,
        }
    }

    /// Sum of all buckets
    pub fn total(&self) -> i64 {
        self.success + self.failure + self.postponed + self.skipped
    }
}

/// Aggregate report over the metadata store
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of records
    pub total: i64,
    /// Records per status
    pub by_status: StatusCounts,
    /// Successful records as a percentage of all records
    pub success_rate: f64,
    /// Successful records whose file moved to cold storage
    pub archived: i64,
    /// Successful, non-archived records whose file is gone
    pub missing: i64,
    /// Mean attempt count
    pub avg_attempts: f64,
    /// Status counts per publisher
    pub by_publisher: BTreeMap<String, StatusCounts>,
    /// Ten publishers with most records
    pub top_publishers: Vec<(String, i64)>,
    /// Attempts per day over the last seven days (`YYYY-MM-DD`)
    pub recent_activity: Vec<(String, i64)>,
    /// Ten most frequent failure reasons
    pub error_reasons: Vec<(String, i64)>,
    /// Status counts per strategy
    pub strategy_stats: BTreeMap<String, StatusCounts>,
}

/// How retryable failures are distributed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Failures still eligible for retry
    pub total_retry: i64,
    /// Eligible failures attempted within the last day
    pub retry_1_day: i64,
    /// Eligible failures attempted within the last week
    pub retry_1_week: i64,
    /// Permanent failures
    pub never_retry: i64,
    /// Failures that exhausted their attempts
    pub max_attempts_reached: i64,
    /// One-line human summary
    pub summary: String,
}

/// Outcome of reconciling stored paths with the filesystem
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Successful records whose file exists
    pub verified: usize,
    /// Successful records whose file is gone
    pub missing: usize,
    /// Successful records that are archived
    pub archived: usize,
}

/// Outcome of merging another store into this one
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Records read from the source store
    pub total_source_entries: usize,
    /// Identifiers only present in the source
    pub added: usize,
    /// Target records replaced by the source version
    pub updated: usize,
    /// Target records kept over the source version
    pub kept_existing: usize,
    /// Source successes that replaced a non-success target record
    pub conflicts_resolved: usize,
    /// PDFs moved into the target directory
    pub files_moved: usize,
    /// PDFs copied into the target directory
    pub files_copied: usize,
    /// PDFs already in place or absent
    pub files_skipped: usize,
    /// Per-record failures (merge continued)
    pub errors: usize,
}

/// Outcome of importing a legacy JSON metadata file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    /// Records inserted
    pub imported: usize,
    /// Identifiers already present in the store
    pub skipped_existing: usize,
    /// Entries with an unreadable status
    pub invalid: usize,
}

/// A PDF on disk that no record points at
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedPdf {
    /// Location of the file
    pub path: PathBuf,
    /// DOI recovered from the filename, if it looks like one
    pub inferred_identifier: Option<String>,
    /// File size in bytes
    pub size_bytes: u64,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            DownloadStatus::Success,
            DownloadStatus::Failure,
            DownloadStatus::Postponed,
            DownloadStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }
        assert!("archived".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DownloadStatus::Postponed).unwrap();
        assert_eq!(json, "\"postponed\"");
    }

    #[test]
    fn test_summary_counts_and_breakdowns() {
        let outcomes = vec![
            FetchOutcome::success("a", PathBuf::from("/p/a.pdf"), "ArXiv", Some("arXiv".into())),
            FetchOutcome::success(
                "b",
                PathBuf::from("/p/b.pdf"),
                PRE_EXISTING_STRATEGY,
                None,
            ),
            FetchOutcome::failure("c", "HTTP 404").with_publisher(Some("Springer".into())),
            FetchOutcome::postponed("d", "HTTP 503"),
            FetchOutcome::postponed("e", "HTTP 503"),
            FetchOutcome::skipped("f", Some("Already downloaded successfully".into())),
        ];

        let summary = BatchSummary::from_outcomes(&outcomes);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.pre_existing, 1);
        assert_eq!(summary.failure, 1);
        assert_eq!(summary.postponed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total(), 6);

        assert_eq!(summary.error_reasons.get("HTTP 503"), Some(&2));
        assert_eq!(summary.error_reasons.get("HTTP 404"), Some(&1));
        assert!(!summary
            .error_reasons
            .contains_key("Already downloaded successfully"));

        let springer = summary.publishers["Springer"];
        assert_eq!(springer.total, 1);
        assert_eq!(springer.success_rate(), 0.0);
        assert_eq!(summary.publishers["arXiv"].success_rate(), 1.0);
    }

    #[test]
    fn test_summary_is_order_independent() {
        let mut outcomes = vec![
            FetchOutcome::failure("x", "HTTP 500"),
            FetchOutcome::postponed("y", "Interrupted before completion"),
            FetchOutcome::skipped("z", None),
        ];
        let forward = BatchSummary::from_outcomes(&outcomes);
        outcomes.reverse();
        assert_eq!(forward, BatchSummary::from_outcomes(&outcomes));
    }

    #[test]
    fn test_cache_analysis_absorb() {
        let mut total = CacheAnalysis::default();
        total.absorb(CacheAnalysis {
            domains_added: 1,
            prefixes_added: 0,
            total_domains: 1,
            total_prefixes: 3,
        });
        total.absorb(CacheAnalysis {
            domains_added: 0,
            prefixes_added: 2,
            total_domains: 1,
            total_prefixes: 5,
        });
        assert_eq!(total.domains_added, 1);
        assert_eq!(total.prefixes_added, 2);
        assert_eq!(total.total_prefixes, 5);
    }
}
