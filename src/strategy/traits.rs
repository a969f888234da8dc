//! Traits and types for PDF location strategies

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a strategy's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStatsSnapshot {
    /// Identifiers this strategy was tried on
    pub handled: u64,
    /// Times a PDF link was found
    pub pdf_found: u64,
    /// Times no PDF link could be found
    pub pdf_not_found: u64,
    /// Failures this strategy judged transient
    pub postponed: u64,
}

/// Per-strategy counters, updated concurrently by batch workers
#[derive(Debug, Default)]
pub struct StrategyStats {
    handled: AtomicU64,
    pdf_found: AtomicU64,
    pdf_not_found: AtomicU64,
    postponed: AtomicU64,
}

impl StrategyStats {
    /// Count an identifier the strategy was tried on
    pub fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the outcome of a PDF link search
    pub fn record_lookup(&self, found: bool) {
        let counter = if found {
            &self.pdf_found
        } else {
            &self.pdf_not_found
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failure the strategy asked to postpone
    pub fn record_postponed(&self) {
        self.postponed.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> StrategyStatsSnapshot {
        StrategyStatsSnapshot {
            handled: self.handled.load(Ordering::Relaxed),
            pdf_found: self.pdf_found.load(Ordering::Relaxed),
            pdf_not_found: self.pdf_not_found.load(Ordering::Relaxed),
            postponed: self.postponed.load(Ordering::Relaxed),
        }
    }
}

/// A way of locating the PDF for a family of identifiers
///
/// The fetcher calls capable strategies in ascending [`priority`](Strategy::priority)
/// and stops at the first one whose URL yields a valid PDF. Strategies never
/// perform the download themselves; they only turn an identifier (and the
/// landing page the fetcher already retrieved) into a candidate URL, and judge
/// whether a failure is worth retrying later.
///
/// # Examples
///
/// ```
/// use pdf_fetch::strategy::{ArxivStrategy, Strategy};
///
/// # #[tokio::main]
/// # async fn main() {
/// let arxiv = ArxivStrategy::default();
/// assert!(arxiv.can_handle("arXiv:2301.12345"));
///
/// let url = arxiv.get_pdf_url("arXiv:2301.12345", "", "").await;
/// assert_eq!(url.as_deref(), Some("https://arxiv.org/pdf/2301.12345.pdf"));
/// # }
/// ```
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Stable name recorded as `strategy_used`
    fn name(&self) -> &str;

    /// Lower runs first (default: 100)
    fn priority(&self) -> i32 {
        100
    }

    /// Whether this strategy knows how to deal with `identifier`
    fn can_handle(&self, identifier: &str) -> bool;

    /// Whether [`get_pdf_url`](Strategy::get_pdf_url) needs the landing page HTML
    ///
    /// The fetcher skips the landing-page request when no capable strategy
    /// needs it.
    fn needs_landing_page(&self) -> bool {
        true
    }

    /// Candidate PDF URL for `identifier`
    ///
    /// # Arguments
    ///
    /// * `identifier` - The DOI or URL being fetched
    /// * `landing_url` - Final URL of the landing page (after redirects)
    /// * `html` - Landing page body, empty when it could not be retrieved
    async fn get_pdf_url(&self, identifier: &str, landing_url: &str, html: &str)
    -> Option<String>;

    /// Whether a failure should be retried later (default: false)
    ///
    /// `html` is the page the failure came with, when there was one: the body
    /// served in place of a PDF, or the landing page that yielded no link.
    fn should_postpone(&self, _error: &str, _html: Option<&str>) -> bool {
        false
    }

    /// Extra headers for the PDF request
    fn custom_headers(&self, _identifier: &str) -> HeaderMap {
        HeaderMap::new()
    }

    /// Rewrite a candidate PDF URL before it is requested
    fn preprocess_url(&self, url: &str) -> String {
        url.to_string()
    }

    /// Hosts this strategy targets
    fn domains(&self) -> &[&str] {
        &[]
    }

    /// DOI prefixes this strategy targets
    fn doi_prefixes(&self) -> &[&str] {
        &[]
    }

    /// Live counters for this strategy
    fn stats(&self) -> &StrategyStats;
}
