//! Configuration types for pdf-fetch

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "pdf_fetch.json";

/// Upper bound on a sub-batch's wall-clock window (one week)
pub const MAX_SUB_BATCH_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

/// Fetching behavior (concurrency, attempt limits, timeouts, batching)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Worker pool size for batch fetches (default: 4)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Attempts per identifier before it stops being retried (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    /// Total timeout for a single HTTP request (default: 30 seconds)
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Abort a download if no body chunk arrives within this window (default: 15 seconds)
    #[serde(default = "default_stall_timeout", with = "duration_serde")]
    pub stall_timeout: Duration,

    /// Minimum time since the last attempt before a failure is retried (default: 24 hours)
    #[serde(default = "default_min_retry_delay", with = "duration_serde")]
    pub min_retry_delay: Duration,

    /// Identifiers per sub-batch (default: 50)
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,

    /// Sub-batch wall-clock budget, in request timeouts per worker round (default: 3)
    ///
    /// The window is `timeout * multiplier * ceil(sub_batch_size / max_workers)`.
    #[serde(default = "default_sub_batch_timeout_multiplier")]
    pub sub_batch_timeout_multiplier: u32,

    /// How long every worker backs off after an HTTP 429 (default: 60 seconds)
    #[serde(default = "default_rate_limit_cooldown", with = "duration_serde")]
    pub rate_limit_cooldown: Duration,

    /// Base URL of the DOI resolver used for landing pages (default: "https://doi.org")
    #[serde(default = "default_doi_resolver")]
    pub doi_resolver: String,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_attempts: default_max_attempts(),
            timeout: default_timeout(),
            stall_timeout: default_stall_timeout(),
            min_retry_delay: default_min_retry_delay(),
            sub_batch_size: default_sub_batch_size(),
            sub_batch_timeout_multiplier: default_sub_batch_timeout_multiplier(),
            rate_limit_cooldown: default_rate_limit_cooldown(),
            doi_resolver: default_doi_resolver(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    /// Wall-clock budget for one sub-batch
    ///
    /// Saturates at [`MAX_SUB_BATCH_WINDOW`].
    pub fn sub_batch_timeout(&self) -> Duration {
        let workers = self.max_workers.max(1);
        let rounds =
            u32::try_from(self.sub_batch_size.div_ceil(workers).max(1)).unwrap_or(u32::MAX);
        self.timeout
            .checked_mul(self.sub_batch_timeout_multiplier.max(1))
            .and_then(|window| window.checked_mul(rounds))
            .map_or(MAX_SUB_BATCH_WINDOW, |window| window.min(MAX_SUB_BATCH_WINDOW))
    }
}

/// Retry configuration for transient failures of the landing-page request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 2)
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Postponement cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostponementConfig {
    /// Pre-filter batches against blocked domains/prefixes/papers (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entries not re-detected within this window stop blocking (default: never expire)
    #[serde(default, with = "optional_duration_serde")]
    pub expiry: Option<Duration>,
}

impl Default for PostponementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry: None,
        }
    }
}

/// Which built-in strategies are registered
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Enable the arXiv strategy (default: true)
    #[serde(default = "default_true")]
    pub arxiv: bool,

    /// Enable the generic landing-page strategy (default: true)
    #[serde(default = "default_true")]
    pub generic: bool,

    /// Base URL for arXiv PDF links (default: "https://arxiv.org")
    #[serde(default = "default_arxiv_base_url")]
    pub arxiv_base_url: String,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            arxiv: true,
            generic: true,
            arxiv_base_url: default_arxiv_base_url(),
        }
    }
}

/// Main configuration for [`PdfFetcher`](crate::PdfFetcher)
///
/// Every field has a default, so an empty JSON object is a valid config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory PDFs are written to (default: "./pdfs")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// SQLite metadata store (default: "./pdf_fetch.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Fetch behavior
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Landing-page retry/backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Postponement cache
    #[serde(default)]
    pub postponement: PostponementConfig,

    /// Built-in strategies
    #[serde(default)]
    pub strategies: StrategyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            database_path: default_database_path(),
            fetch: FetchConfig::default(),
            retry: RetryConfig::default(),
            postponement: PostponementConfig::default(),
            strategies: StrategyConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("Failed to read config file {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| Error::Config {
            message: format!("Failed to parse config file {}: {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load configuration from an explicit path, `./pdf_fetch.json`, or defaults
    ///
    /// An explicit path that does not exist is an error; a missing default file is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::from_file(local);
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Reject settings that would make the fetcher unusable
    pub fn validate(&self) -> Result<()> {
        if self.fetch.max_workers == 0 {
            return Err(invalid("max_workers must be at least 1", "fetch.max_workers"));
        }
        if self.fetch.max_attempts < 1 {
            return Err(invalid(
                "max_attempts must be at least 1",
                "fetch.max_attempts",
            ));
        }
        if self.fetch.sub_batch_size == 0 {
            return Err(invalid(
                "sub_batch_size must be at least 1",
                "fetch.sub_batch_size",
            ));
        }
        if self.fetch.timeout.is_zero() {
            return Err(invalid("timeout must be non-zero", "fetch.timeout"));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(invalid(
                "backoff_multiplier must be a finite number of at least 1.0",
                "retry.backoff_multiplier",
            ));
        }
        if url::Url::parse(&self.fetch.doi_resolver).is_err() {
            return Err(invalid(
                "doi_resolver must be an absolute URL",
                "fetch.doi_resolver",
            ));
        }
        Ok(())
    }
}

fn invalid(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./pdfs")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./pdf_fetch.db")
}

fn default_max_workers() -> usize {
    4
}

fn default_max_attempts() -> i64 {
    3
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_min_retry_delay() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sub_batch_size() -> usize {
    50
}

fn default_sub_batch_timeout_multiplier() -> u32 {
    3
}

fn default_rate_limit_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_doi_resolver() -> String {
    "https://doi.org".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_arxiv_base_url() -> String {
    "https://arxiv.org".to_string()
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
