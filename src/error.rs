//! Error types for pdf-fetch
//!
//! This module provides error handling for the library, including:
//! - Library-level errors (configuration, database, I/O, network)
//! - Per-strategy fetch failures whose messages become persisted `error_reason` values

use thiserror::Error;

/// Result type alias for pdf-fetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pdf-fetch
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "fetch.max_workers")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single strategy failed to produce a PDF
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Identifier could not be interpreted as a DOI, arXiv id or URL
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., duplicate key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Failure of one strategy's attempt at one identifier
///
/// The `Display` output is what gets stored as `error_reason`, and what
/// strategies inspect in `should_postpone`, so the wording is stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Strategy could not locate a PDF link
    #[error("Could not find PDF URL")]
    NoPdfUrl,

    /// Non-success HTTP status
    #[error("HTTP {0}")]
    HttpStatus(u16),

    /// Server answered 429
    #[error("Rate limited (HTTP 429)")]
    RateLimited,

    /// Whole request exceeded the total timeout
    #[error("Timeout after {0}s")]
    Timeout(u64),

    /// No bytes arrived within the stall timeout
    #[error("Stalled: no data for {0}s")]
    Stalled(u64),

    /// Body did not start with the PDF magic bytes
    #[error("Downloaded file is not a PDF")]
    NotPdf,

    /// HTML Cloudflare interstitial served instead of the PDF
    #[error("Cloudflare challenge page detected")]
    CloudflareChallenge,

    /// HTML captcha served instead of the PDF
    #[error("Captcha challenge page detected")]
    CaptchaChallenge,

    /// Publisher paywall page
    #[error("Paywall: subscription required")]
    Paywall,

    /// Transport-level failure (DNS, connect, reset)
    #[error("Request failed: {0}")]
    Request(String),
}

impl FetchError {
    /// Whether this failure came from an anti-bot challenge page
    pub fn is_challenge(&self) -> bool {
        matches!(
            self,
            FetchError::CloudflareChallenge | FetchError::CaptchaChallenge
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.as_u16() == 429 => FetchError::RateLimited,
            Some(status) => FetchError::HttpStatus(status.as_u16()),
            None => FetchError::Request(e.to_string()),
        }
    }
}
