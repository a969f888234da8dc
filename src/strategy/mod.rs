//! PDF location strategies
//!
//! A strategy turns an identifier into a candidate PDF URL. The fetcher owns
//! all HTTP traffic; strategies only inspect identifiers and landing pages and
//! judge their own failures.
//!
//! ## Architecture
//!
//! The core abstraction is the [`Strategy`] trait. Built-in implementations:
//!
//! - [`ArxivStrategy`]: derives `/pdf/{id}.pdf` links from arXiv ids and DOIs
//! - [`GenericStrategy`]: scrapes the DOI landing page for a PDF link
//!
//! Custom strategies can be mixed in through
//! [`PdfFetcher::with_parts`](crate::PdfFetcher::with_parts).
//!
//! ## Usage
//!
//! ```
//! use pdf_fetch::config::StrategyConfig;
//! use pdf_fetch::strategy::default_strategies;
//!
//! let strategies = default_strategies(&StrategyConfig::default());
//! let names: Vec<&str> = strategies.iter().map(|s| s.name()).collect();
//! assert_eq!(names, ["ArXiv", "Generic"]);
//! ```

mod arxiv;
mod generic;
mod traits;

pub use arxiv::{ARXIV_BASE_URL, ArxivStrategy};
pub use generic::GenericStrategy;
pub use traits::{Strategy, StrategyStats, StrategyStatsSnapshot};

use crate::config::StrategyConfig;
use std::sync::Arc;

/// Built-in strategies enabled by `config`, in ascending priority
pub fn default_strategies(config: &StrategyConfig) -> Vec<Arc<dyn Strategy>> {
    let mut strategies: Vec<Arc<dyn Strategy>> = Vec::new();
    if config.arxiv {
        strategies.push(Arc::new(ArxivStrategy::new(config.arxiv_base_url.clone())));
    }
    if config.generic {
        strategies.push(Arc::new(GenericStrategy::new()));
    }
    sort_by_priority(&mut strategies);
    strategies
}

/// Order strategies the way the fetcher tries them
///
/// The sort is stable, so equal priorities keep their registration order.
pub fn sort_by_priority(strategies: &mut [Arc<dyn Strategy>]) {
    strategies.sort_by_key(|s| s.priority());
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategies_respect_config() {
        let config = StrategyConfig {
            arxiv: false,
            ..Default::default()
        };
        let strategies = default_strategies(&config);
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].name(), "Generic");
    }

    #[test]
    fn test_sort_by_priority() {
        let mut strategies: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(GenericStrategy::new()),
            Arc::new(ArxivStrategy::default()),
        ];
        sort_by_priority(&mut strategies);
        assert_eq!(strategies[0].name(), "ArXiv");
    }

    #[test]
    fn test_stats_snapshot() {
        let strategy = GenericStrategy::new();
        strategy.stats().record_handled();
        strategy.stats().record_handled();
        strategy.stats().record_lookup(true);
        strategy.stats().record_lookup(false);
        strategy.stats().record_postponed();

        assert_eq!(
            strategy.stats().snapshot(),
            StrategyStatsSnapshot {
                handled: 2,
                pdf_found: 1,
                pdf_not_found: 1,
                postponed: 1,
            }
        );
    }
}
