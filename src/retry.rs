//! Retry decisions and failure classification
//!
//! Three layers live here:
//! - [`RetryPolicy`]: the pure per-identifier decision of whether a stored record
//!   may be attempted again (attempt limits, permanent failures, minimum delay)
//! - [`classify_failure`] / [`IsRetryable`]: the transient-vs-permanent taxonomy
//!   applied to failure messages and error values
//! - [`with_retry`]: in-request exponential backoff for transient network errors
//!
//! # Example
//!
//! ```
//! use pdf_fetch::retry::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3);
//! assert_eq!(policy.evaluate(None), RetryDecision::Allow);
//! ```

use crate::config::RetryConfig;
use crate::db::DownloadRecord;
use crate::error::{Error, FetchError};
use crate::types::DownloadStatus;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Where an identifier stands in its retry lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryState {
    /// No record exists
    NeverTried,
    /// Downloaded; terminal
    Succeeded,
    /// Failed with `should_retry = false`; terminal
    PermanentFailure,
    /// Failed transiently with attempts to spare
    Retryable {
        /// Attempts recorded so far
        attempts: i64,
    },
    /// Attempts exhausted; terminal until manually reset
    MaxAttempts {
        /// Attempts recorded so far
        attempts: i64,
    },
}

/// Whether an identifier may be attempted now
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt it
    Allow,
    /// Do not attempt it, for the given reason
    Deny(String),
}

impl RetryDecision {
    /// True for [`RetryDecision::Allow`]
    pub fn allowed(&self) -> bool {
        matches!(self, RetryDecision::Allow)
    }

    /// Denial reason, if denied
    pub fn reason(&self) -> Option<&str> {
        match self {
            RetryDecision::Allow => None,
            RetryDecision::Deny(reason) => Some(reason),
        }
    }

    /// `(allowed, reason)` pair
    pub fn into_parts(self) -> (bool, Option<String>) {
        match self {
            RetryDecision::Allow => (true, None),
            RetryDecision::Deny(reason) => (false, Some(reason)),
        }
    }
}

/// Attempt limits and time gating for stored records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which an identifier is no longer retried
    pub max_attempts: i64,
    /// Minimum time since `last_attempted` before a retryable failure is tried again
    pub min_retry_delay: Option<Duration>,
}

impl RetryPolicy {
    /// Policy without time gating
    pub fn new(max_attempts: i64) -> Self {
        Self {
            max_attempts,
            min_retry_delay: None,
        }
    }

    /// Add a minimum delay between attempts
    pub fn with_min_retry_delay(mut self, delay: Duration) -> Self {
        self.min_retry_delay = Some(delay);
        self
    }

    /// Classify a record
    ///
    /// A permanent failure is reported as such even when its attempts are also exhausted.
    pub fn state(&self, record: Option<&DownloadRecord>) -> RetryState {
        let Some(record) = record else {
            return RetryState::NeverTried;
        };

        if record.status == DownloadStatus::Success {
            RetryState::Succeeded
        } else if !record.should_retry {
            RetryState::PermanentFailure
        } else if record.attempt_count >= self.max_attempts {
            RetryState::MaxAttempts {
                attempts: record.attempt_count,
            }
        } else {
            RetryState::Retryable {
                attempts: record.attempt_count,
            }
        }
    }

    /// Decide without considering elapsed time
    pub fn evaluate(&self, record: Option<&DownloadRecord>) -> RetryDecision {
        match (self.state(record), record) {
            (RetryState::Succeeded, _) => {
                RetryDecision::Deny("Already downloaded successfully".to_string())
            }
            (RetryState::PermanentFailure, Some(record)) => RetryDecision::Deny(format!(
                "Permanent failure: {}",
                record.error_reason.as_deref().unwrap_or("unknown")
            )),
            (RetryState::MaxAttempts { attempts }, _) => RetryDecision::Deny(format!(
                "Max attempts reached ({}/{})",
                attempts, self.max_attempts
            )),
            _ => RetryDecision::Allow,
        }
    }

    /// Decide at Unix time `now`, additionally enforcing `min_retry_delay`
    ///
    /// The delay is measured from `last_attempted` and only gates records that would
    /// otherwise be allowed. Records reset by `mark_for_retry` (zero attempts) are not gated.
    pub fn evaluate_at(&self, record: Option<&DownloadRecord>, now: i64) -> RetryDecision {
        let decision = self.evaluate(record);
        if !decision.allowed() {
            return decision;
        }

        let (Some(record), Some(delay)) = (record, self.min_retry_delay) else {
            return decision;
        };
        if record.attempt_count == 0 {
            return decision;
        }

        let elapsed = now - record.last_attempted;
        let required = delay.as_secs() as i64;
        if elapsed < required {
            let remaining_hours = (required - elapsed) as f64 / 3600.0;
            return RetryDecision::Deny(format!(
                "Too soon to retry (wait {:.1}h more)",
                remaining_hours
            ));
        }

        decision
    }
}

/// Whether a failure is expected to go away on its own
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry later
    Transient,
    /// Never retry automatically
    Permanent,
}

const TRANSIENT_MARKERS: &[&str] = &[
    "403",
    "429",
    "500",
    "502",
    "503",
    "504",
    "timeout",
    "timed out",
    "stalled",
    "cloudflare",
    "captcha",
    "rate limit",
    "request failed",
    "connection",
];

const PERMANENT_MARKERS: &[&str] = &[
    "could not find pdf",
    "404",
    "not found",
    "invalid doi",
    "invalid identifier",
    "paywall",
    "subscription required",
    "no strategy can handle",
];

/// Classify a failure message
///
/// Transient signatures win over permanent ones; unrecognised messages are
/// treated as transient.
pub fn classify_failure(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureKind::Transient
    } else if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureKind::Permanent
    } else {
        FailureKind::Transient
    }
}

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (not found, paywall, corrupt data) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpStatus(code) => matches!(code, 403 | 408 | 429 | 500..=599),
            FetchError::RateLimited
            | FetchError::Timeout(_)
            | FetchError::Stalled(_)
            | FetchError::CloudflareChallenge
            | FetchError::CaptchaChallenge
            | FetchError::Request(_) => true,
            // Ambiguous HTML: optimistic
            FetchError::NotPdf => true,
            FetchError::NoPdfUrl | FetchError::Paywall => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Fetch(e) => e.is_retryable(),
            Error::Config { .. }
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Serialization(_)
            | Error::NotFound(_)
            | Error::InvalidIdentifier(_)
            | Error::Other(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
/// Non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::time::sleep(jittered_delay).await;

                delay = next_delay(delay, config);
            }
            Err(e) => {
                tracing::debug!(error = %e, attempts = attempt + 1, "Operation failed");
                return Err(e);
            }
        }
    }
}

/// Backed-off delay, capped at `max_delay`
///
/// A product that is not a valid duration (negative, NaN, overflow) falls back
/// to `max_delay`.
fn next_delay(delay: Duration, config: &RetryConfig) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
        .map_or(config.max_delay, |next| next.min(config.max_delay))
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor)).unwrap_or(delay)
}
