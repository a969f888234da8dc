//! PDF fetch orchestration
//!
//! [`PdfFetcher`] ties the metadata store, the postponement cache and the
//! strategies together:
//!
//! - [`single`] - One identifier: eligibility, pre-existing files, strategies in priority order
//! - [`download`] - Landing pages and PDF downloads with stall and total timeouts
//! - [`batch`] - Pre-filtering, sub-batches on a bounded worker pool, cancellation
//! - [`rate_limit`] - Cooldown shared by all workers after an HTTP 429

mod batch;
mod download;
mod rate_limit;
mod single;


pub use batch::{INTERRUPTED_REASON, POSTPONED_SKIP_REASON};
pub use rate_limit::RateLimitState;
pub use single::NO_STRATEGY_REASON;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::postponed::PostponementCache;
use crate::strategy::{Strategy, StrategyStatsSnapshot, default_strategies, sort_by_priority};
use std::sync::Arc;

/// Fetches PDFs for DOIs, arXiv ids and URLs
///
/// Cheap to clone; clones share the store, cache, strategies, HTTP client and
/// rate-limit state. Batch workers each hold a clone.
///
/// # Example
///
/// ```no_run
/// use pdf_fetch::{Config, PdfFetcher};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let fetcher = PdfFetcher::new(Config::default()).await?;
///
///     let cancel = CancellationToken::new();
///     pdf_fetch::shutdown_on_signal(cancel.clone());
///
///     let ids = vec!["10.1007/s10623-024-01403-z".to_string()];
///     let report = fetcher.fetch_batch(&ids, false, cancel).await?;
///     println!("{} downloaded", report.summary.success);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct PdfFetcher {
    config: Arc<Config>,
    db: Database,
    cache: PostponementCache,
    strategies: Arc<[Arc<dyn Strategy>]>,
    client: reqwest::Client,
    rate_limit: RateLimitState,
}

impl std::fmt::Debug for PdfFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfFetcher")
            .field("config", &self.config)
            .field("db", &self.db)
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl PdfFetcher {
    /// Open the store at `config.database_path`, restore the postponement cache
    /// and register the built-in strategies
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the store cannot be opened.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.database_path).await?;
        let cache = if config.postponement.enabled {
            PostponementCache::load(db.clone(), &config.postponement).await?
        } else {
            PostponementCache::in_memory(config.postponement.expiry)
        };
        let strategies = default_strategies(&config.strategies);

        Self::with_parts(config, db, cache, strategies)
    }

    /// Assemble a fetcher from existing parts
    ///
    /// Strategies are tried in ascending priority regardless of the order given.
    pub fn with_parts(
        config: Config,
        db: Database,
        cache: PostponementCache,
        mut strategies: Vec<Arc<dyn Strategy>>,
    ) -> Result<Self> {
        config.validate()?;
        sort_by_priority(&mut strategies);

        let client = reqwest::Client::builder()
            .user_agent(config.fetch.user_agent.clone())
            .connect_timeout(config.fetch.timeout)
            .build()?;

        tracing::info!(
            strategies = ?strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            max_workers = config.fetch.max_workers,
            output_dir = %config.output_dir.display(),
            "PDF fetcher ready"
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            cache,
            strategies: strategies.into(),
            client,
            rate_limit: RateLimitState::new(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metadata store
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Postponement cache
    pub fn cache(&self) -> &PostponementCache {
        &self.cache
    }

    /// Registered strategies, in the order they are tried
    pub fn strategies(&self) -> &[Arc<dyn Strategy>] {
        &self.strategies
    }

    /// Shared 429 cooldown
    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    /// Counters of every strategy, by name
    pub fn strategy_stats(&self) -> Vec<(String, StrategyStatsSnapshot)> {
        self.strategies
            .iter()
            .map(|s| (s.name().to_string(), s.stats().snapshot()))
            .collect()
    }
}
