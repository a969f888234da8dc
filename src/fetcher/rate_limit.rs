//! Shared back-off after HTTP 429

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Process-wide "a server told us to slow down" flag
///
/// Owned by one [`PdfFetcher`](crate::PdfFetcher) and shared by every worker it
/// spawns. Tripping it makes every worker hold its next request until the
/// cooldown has passed. A trip that lands while already limited extends the
/// deadline, never shortens it.
///
/// # Examples
///
/// ```
/// use pdf_fetch::fetcher::RateLimitState;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let state = RateLimitState::new();
/// assert!(!state.is_limited());
///
/// state.trip(Duration::from_secs(60));
/// assert!(state.is_limited());
/// assert!(state.remaining().unwrap() <= Duration::from_secs(60));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct RateLimitState {
    epoch: Instant,
    /// Deadline in nanoseconds since `epoch`; limited while it lies ahead
    until_nanos: Arc<AtomicU64>,
    trips: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    /// Unlimited state
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            until_nanos: Arc::new(AtomicU64::new(0)),
            trips: Arc::new(AtomicU64::new(0)),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Start (or extend) a cooldown
    pub fn trip(&self, cooldown: Duration) {
        let until = self.now_nanos().saturating_add(cooldown.as_nanos() as u64);
        self.until_nanos.fetch_max(until, Ordering::SeqCst);
        let trips = self.trips.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            cooldown_secs = cooldown.as_secs(),
            trips,
            "Rate limited, pausing all workers"
        );
    }

    /// Time left in the current cooldown
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.until_nanos.load(Ordering::SeqCst);
        let now = self.now_nanos();
        (until > now).then(|| Duration::from_nanos(until - now))
    }

    /// Whether a cooldown is in effect
    pub fn is_limited(&self) -> bool {
        self.remaining().is_some()
    }

    /// Number of times the limit was tripped
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Sleep out the cooldown
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        while let Some(remaining) = self.remaining() {
            tracing::debug!(remaining_ms = remaining.as_millis(), "Waiting out rate limit");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        !cancel.is_cancelled()
    }
}
