//! Postponement cache
//!
//! Tracks domains, DOI prefixes and individual identifiers that are currently believed
//! to be blocked (Cloudflare, 403, captcha, hangs), so a batch can skip them without
//! spending a request.
//!
//! The in-memory maps are authoritative for decisions made during a run. When built
//! with [`PostponementCache::load`], every change is also written to the store; those
//! writes are best-effort and only logged on failure.

use crate::config::PostponementConfig;
use crate::db::{Database, PostponedKind, PostponedRow};
use crate::types::{CacheAnalysis, DownloadStatus, FetchOutcome};
use crate::utils::{doi_prefix, is_url, url_host};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Reason recorded for identifiers abandoned by a sub-batch timeout
pub const TIMED_OUT_IN_BATCH: &str = "Timed out in batch";

/// One blocked key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostponedEntry {
    /// Why it was blocked
    pub reason: String,
    /// Unix timestamp of the first detection
    pub first_detected: i64,
    /// Unix timestamp of the most recent detection
    pub last_detected: i64,
    /// Number of detections
    pub detection_count: i64,
}

impl From<PostponedRow> for PostponedEntry {
    fn from(row: PostponedRow) -> Self {
        Self {
            reason: row.reason,
            first_detected: row.first_detected,
            last_detected: row.last_detected,
            detection_count: row.detection_count,
        }
    }
}

/// Result of partitioning a batch against the cache
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchPartition {
    /// Identifiers to attempt, in input order
    pub processable: Vec<String>,
    /// Identifiers to skip, with the reason, in input order
    pub blocked: Vec<(String, String)>,
}

/// Snapshot of the cache contents
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostponementStats {
    /// Number of blocked domains
    pub blocked_domains: usize,
    /// Number of blocked DOI prefixes
    pub blocked_doi_prefixes: usize,
    /// Number of blocked identifiers
    pub blocked_papers: usize,
    /// Blocked domains, sorted
    pub domains: Vec<String>,
    /// Blocked DOI prefixes, sorted
    pub doi_prefixes: Vec<String>,
}

#[derive(Debug, Default)]
struct Blocklists {
    domains: HashMap<String, PostponedEntry>,
    prefixes: HashMap<String, PostponedEntry>,
    papers: HashMap<String, PostponedEntry>,
}

impl Blocklists {
    fn map(&self, kind: PostponedKind) -> &HashMap<String, PostponedEntry> {
        match kind {
            PostponedKind::Domain => &self.domains,
            PostponedKind::DoiPrefix => &self.prefixes,
            PostponedKind::Paper => &self.papers,
        }
    }

    fn map_mut(&mut self, kind: PostponedKind) -> &mut HashMap<String, PostponedEntry> {
        match kind {
            PostponedKind::Domain => &mut self.domains,
            PostponedKind::DoiPrefix => &mut self.prefixes,
            PostponedKind::Paper => &mut self.papers,
        }
    }
}

/// Shared blocklists of domains, DOI prefixes and papers
///
/// Cheap to clone; clones share state.
#[derive(Clone, Debug)]
pub struct PostponementCache {
    lists: Arc<RwLock<Blocklists>>,
    db: Option<Database>,
    expiry: Option<Duration>,
}

impl PostponementCache {
    /// Cache that is never persisted
    pub fn in_memory(expiry: Option<Duration>) -> Self {
        Self {
            lists: Arc::new(RwLock::new(Blocklists::default())),
            db: None,
            expiry,
        }
    }

    /// Restore persisted entries from `db` and persist future changes to it
    ///
    /// Entries already expired under `config.expiry` are not loaded.
    pub async fn load(db: Database, config: &PostponementConfig) -> Result<Self> {
        let cache = Self {
            lists: Arc::new(RwLock::new(Blocklists::default())),
            db: Some(db.clone()),
            expiry: config.expiry,
        };

        let now = chrono::Utc::now().timestamp();
        {
            let mut lists = cache.lists.write().await;
            for kind in PostponedKind::ALL {
                for row in db.load_postponed(kind).await? {
                    let key = row.key.clone();
                    let entry = PostponedEntry::from(row);
                    if cache.is_expired(&entry, now) {
                        continue;
                    }
                    lists.map_mut(kind).insert(key, entry);
                }
            }

            tracing::info!(
                domains = lists.domains.len(),
                prefixes = lists.prefixes.len(),
                papers = lists.papers.len(),
                "Loaded postponement cache"
            );
        }

        Ok(cache)
    }

    fn is_expired(&self, entry: &PostponedEntry, now: i64) -> bool {
        match self.expiry {
            Some(expiry) => now - entry.last_detected >= expiry.as_secs() as i64,
            None => false,
        }
    }

    /// Live entry for `key`, honouring expiry
    async fn lookup(&self, kind: PostponedKind, key: &str) -> Option<PostponedEntry> {
        let lists = self.lists.read().await;
        let entry = lists.map(kind).get(key)?;
        if self.is_expired(entry, chrono::Utc::now().timestamp()) {
            return None;
        }
        Some(entry.clone())
    }

    /// Insert or bump an entry; returns true if the key was not blocked before
    async fn add(&self, kind: PostponedKind, key: &str, reason: &str) -> bool {
        if key.is_empty() {
            return false;
        }

        let now = chrono::Utc::now().timestamp();
        let newly_blocked = {
            let mut lists = self.lists.write().await;
            let expired = lists
                .map(kind)
                .get(key)
                .is_some_and(|entry| self.is_expired(entry, now));
            let map = lists.map_mut(kind);
            if expired {
                map.remove(key);
            }

            match map.get_mut(key) {
                Some(entry) => {
                    entry.detection_count += 1;
                    entry.last_detected = now;
                    entry.reason = reason.to_string();
                    false
                }
                None => {
                    map.insert(
                        key.to_string(),
                        PostponedEntry {
                            reason: reason.to_string(),
                            first_detected: now,
                            last_detected: now,
                            detection_count: 1,
                        },
                    );
                    true
                }
            }
        };

        if newly_blocked {
            tracing::info!(kind = %kind, key, reason, "Added to postponement cache");
        }

        if let Some(db) = &self.db
            && let Err(e) = db.upsert_postponed(kind, key, reason).await
        {
            tracing::warn!(kind = %kind, key, error = %e, "Failed to persist postponed entry");
        }

        newly_blocked
    }

    /// Block a host
    pub async fn add_domain(&self, domain: &str, reason: &str) -> bool {
        self.add(PostponedKind::Domain, &domain.to_lowercase(), reason)
            .await
    }

    /// Block a DOI registrant prefix such as `10.1016`
    pub async fn add_doi_prefix(&self, prefix: &str, reason: &str) -> bool {
        self.add(PostponedKind::DoiPrefix, prefix, reason).await
    }

    /// Block one identifier
    pub async fn add_paper(&self, identifier: &str, reason: &str) -> bool {
        self.add(PostponedKind::Paper, identifier, reason).await
    }

    /// Whether `doi`'s prefix is blocked; accepts bare DOIs and `doi.org/` URLs
    pub async fn should_skip_doi(&self, doi: &str) -> Option<String> {
        let prefix = doi_prefix(doi)?;
        self.lookup(PostponedKind::DoiPrefix, prefix)
            .await
            .map(|_| format!("DOI prefix {} is postponed (Cloudflare/access issues)", prefix))
    }

    /// Whether `url`'s host is blocked
    pub async fn should_skip_url(&self, url: &str) -> Option<String> {
        let host = url_host(url)?;
        self.lookup(PostponedKind::Domain, &host)
            .await
            .map(|_| format!("Domain {} is postponed (Cloudflare/access issues)", host))
    }

    /// Whether this exact identifier is blocked
    pub async fn should_skip_paper(&self, identifier: &str) -> Option<String> {
        self.lookup(PostponedKind::Paper, identifier)
            .await
            .map(|entry| format!("Paper is postponed ({})", entry.reason))
    }

    /// Partition a batch into identifiers to attempt and identifiers to skip
    ///
    /// Checks the paper list, then the DOI prefix, then the URL host. Every input lands
    /// in exactly one side, in its original order.
    pub async fn filter_batch(&self, identifiers: &[String]) -> BatchPartition {
        let mut partition = BatchPartition::default();

        for identifier in identifiers {
            let reason = match self.should_skip_paper(identifier).await {
                Some(reason) => Some(reason),
                None => match self.should_skip_doi(identifier).await {
                    Some(reason) => Some(reason),
                    None => self.should_skip_url(identifier).await,
                },
            };

            match reason {
                Some(reason) => partition.blocked.push((identifier.clone(), reason)),
                None => partition.processable.push(identifier.clone()),
            }
        }

        if !partition.blocked.is_empty() {
            tracing::info!(
                blocked = partition.blocked.len(),
                total = identifiers.len(),
                "Pre-filtered identifiers from postponement cache"
            );
        }

        partition
    }

    /// Learn from one outcome: Cloudflare or 403 failures block the identifier's
    /// domain and DOI prefix
    pub async fn analyze_result(&self, outcome: &FetchOutcome) -> CacheAnalysis {
        let mut analysis = CacheAnalysis::default();

        if !matches!(
            outcome.status,
            DownloadStatus::Failure | DownloadStatus::Postponed
        ) {
            return analysis;
        }

        let error = outcome
            .error_reason
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        let is_cloudflare = error.contains("cloudflare") || error.contains("cf-ray");
        let is_forbidden = error.contains("403") || error.contains("forbidden");
        if !is_cloudflare && !is_forbidden {
            return analysis;
        }
        let reason = if is_cloudflare {
            "Cloudflare"
        } else {
            "403 Forbidden"
        };

        if is_url(&outcome.identifier)
            && let Some(host) = url_host(&outcome.identifier)
            && self.add_domain(&host, reason).await
        {
            analysis.domains_added += 1;
        }

        if let Some(prefix) = doi_prefix(&outcome.identifier)
            && self.add_doi_prefix(prefix, reason).await
        {
            analysis.prefixes_added += 1;
        }

        analysis
    }

    /// [`Self::analyze_result`] over a batch, with the cache totals afterwards
    pub async fn analyze_batch(&self, outcomes: &[FetchOutcome]) -> CacheAnalysis {
        let mut analysis = CacheAnalysis::default();
        for outcome in outcomes {
            analysis.absorb(self.analyze_result(outcome).await);
        }

        {
            let lists = self.lists.read().await;
            analysis.total_domains = lists.domains.len();
            analysis.total_prefixes = lists.prefixes.len();
        }

        if analysis.domains_added > 0 || analysis.prefixes_added > 0 {
            tracing::info!(
                domains_added = analysis.domains_added,
                prefixes_added = analysis.prefixes_added,
                "Updated postponement cache from batch"
            );
        }

        analysis
    }

    /// Counts and sorted contents
    pub async fn get_stats(&self) -> PostponementStats {
        let lists = self.lists.read().await;

        let mut domains: Vec<String> = lists.domains.keys().cloned().collect();
        domains.sort();
        let mut doi_prefixes: Vec<String> = lists.prefixes.keys().cloned().collect();
        doi_prefixes.sort();

        PostponementStats {
            blocked_domains: lists.domains.len(),
            blocked_doi_prefixes: lists.prefixes.len(),
            blocked_papers: lists.papers.len(),
            domains,
            doi_prefixes,
        }
    }

    /// The entry for `key`, if blocked
    pub async fn entry(&self, kind: PostponedKind, key: &str) -> Option<PostponedEntry> {
        self.lookup(kind, key).await
    }

    /// Unblock one key; returns whether it was blocked
    pub async fn remove_entry(&self, kind: PostponedKind, key: &str) -> bool {
        let removed = self.lists.write().await.map_mut(kind).remove(key).is_some();

        if let Some(db) = &self.db
            && let Err(e) = db.delete_postponed(kind, key).await
        {
            tracing::warn!(kind = %kind, key, error = %e, "Failed to delete persisted postponed entry");
        }

        removed
    }

    /// Drop every entry of every kind
    pub async fn clear(&self) {
        {
            let mut lists = self.lists.write().await;
            lists.domains.clear();
            lists.prefixes.clear();
            lists.papers.clear();
        }

        if let Some(db) = &self.db
            && let Err(e) = db.clear_postponed().await
        {
            tracing::warn!(error = %e, "Failed to clear persisted postponement cache");
        }

        tracing::info!("Cleared postponement cache");
    }
}
