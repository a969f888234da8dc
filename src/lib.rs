//! # pdf-fetch
//!
//! Fetches academic PDFs for DOIs, arXiv identifiers and URLs, and remembers
//! what happened to every one of them.
//!
//! ## Design Philosophy
//!
//! pdf-fetch is designed to be:
//! - **Stateful** - Every attempt lands in a SQLite metadata store, so repeated
//!   batch runs only spend requests on identifiers that can still succeed
//! - **Polite** - Domains and DOI prefixes that answer with Cloudflare or 403 are
//!   postponed as a whole, and an HTTP 429 pauses every worker
//! - **Library-first** - No CLI; strategies, cancellation and reporting are
//!   plain Rust values
//!
//! ## Quick Start
//!
//! ```no_run
//! use pdf_fetch::{Config, PdfFetcher};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let fetcher = PdfFetcher::new(config).await?;
//!
//!     // First Ctrl+C abandons the batch, second one exits
//!     let cancel = CancellationToken::new();
//!     pdf_fetch::shutdown_on_signal(cancel.clone());
//!
//!     let ids = vec![
//!         "10.1007/s10623-024-01403-z".to_string(),
//!         "arXiv:2301.12345".to_string(),
//!     ];
//!     let report = fetcher.fetch_batch(&ids, false, cancel).await?;
//!
//!     for outcome in &report.outcomes {
//!         println!("{}: {}", outcome.identifier, outcome.status);
//!     }
//!     for (reason, count) in &report.summary.error_reasons {
//!         println!("{count:>4}  {reason}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Metadata store
pub mod db;
/// Error types
pub mod error;
/// Fetch orchestration
pub mod fetcher;
/// Blocked domains, DOI prefixes and papers
pub mod postponed;
/// Retry decisions, failure taxonomy and backoff
pub mod retry;
/// PDF location strategies
pub mod strategy;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, FetchConfig, PostponementConfig, RetryConfig, StrategyConfig};
pub use db::{Database, DownloadRecord, MergeOptions, NewFailure, NewSuccess, PostponedKind};
pub use error::{DatabaseError, Error, FetchError, Result};
pub use fetcher::{PdfFetcher, RateLimitState};
pub use postponed::{BatchPartition, PostponementCache, PostponementStats};
pub use retry::{FailureKind, RetryDecision, RetryPolicy, RetryState, classify_failure};
pub use strategy::{ArxivStrategy, GenericStrategy, Strategy, StrategyStats};
pub use types::{
    BatchReport, BatchSummary, CacheAnalysis, DownloadStatus, FetchOutcome, ImportStats,
    MergeStats, OrphanedPdf, RetryStats, StoreStats, VerifyReport,
};

use tokio_util::sync::CancellationToken;

/// Translate OS termination signals into cancellation of `token`
///
/// Spawns a listener task. The first SIGINT/SIGTERM (Ctrl+C on other
/// platforms) cancels `token`, which makes a running
/// [`PdfFetcher::fetch_batch`] abandon in-flight work and report the rest as
/// interrupted. A second signal exits the process with status 130.
///
/// # Example
///
/// ```no_run
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let cancel = CancellationToken::new();
///     let listener = pdf_fetch::shutdown_on_signal(cancel.clone());
///
///     cancel.cancelled().await;
///     listener.abort();
/// }
/// ```
pub fn shutdown_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !wait_for_signal().await {
            return;
        }
        tracing::warn!("Interrupt received, finishing up (signal again to force exit)");
        token.cancel();

        if wait_for_signal().await {
            tracing::error!("Second interrupt received, exiting");
            std::process::exit(130);
        }
    })
}

/// Wait for a termination signal; `false` if no handler could be registered
#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
            true
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
            true
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
            true
        }
        (Err(_), Err(e)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.is_ok()
        }
    }
}

/// Wait for Ctrl+C; `false` if it cannot be listened for
#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            false
        }
    }
}
