//! Configuration settings and validation.

use crate::indexer::ChunkerConfig;
use crate::watcher::PathFilter;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Exclusion patterns applied when none are configured.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &["*.swp", "*.tmp", "*~", ".git/*", "node_modules/*"];

/// How keyword terms combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMode {
    /// A chunk matches if any term matches (OR).
    #[default]
    Any,
    /// A chunk matches only if every term matches (AND).
    All,
}

impl FromStr for KeywordMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "any" | "or" => Ok(Self::Any),
            "all" | "and" => Ok(Self::All),
            other => Err(format!("unknown keyword mode '{other}', expected 'any' or 'all'")),
        }
    }
}

impl fmt::Display for KeywordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::All => f.write_str("all"),
        }
    }
}

/// What to do with files whose type has no registered chunking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownFiletypePolicy {
    /// Split into fixed-size overlapping windows.
    #[default]
    Window,
    /// Record nothing.
    Skip,
}

impl FromStr for UnknownFiletypePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "window" => Ok(Self::Window),
            "skip" => Ok(Self::Skip),
            other => Err(format!(
                "unknown filetype policy '{other}', expected 'window' or 'skip'"
            )),
        }
    }
}

/// Exponential backoff settings shared by the embedder client and the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No retries, no delay. Used by tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based), with up to 25% jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exp.min(self.max_delay);
        if capped.is_zero() {
            return capped;
        }
        let jitter_ms = capped.as_millis() as u64 / 4;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        capped
            .saturating_sub(Duration::from_millis(jitter_ms))
            .saturating_add(Duration::from_millis(jitter))
    }
}

/// Main configuration for the indexer service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for `SQLite` database and other data.
    pub data_dir: PathBuf,

    /// Host address to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Roots of the indexed subtrees. Must be absolute.
    pub watch_roots: Vec<PathBuf>,

    /// Exclusion globs, evaluated in order.
    pub exclude_patterns: Vec<String>,

    /// Also honor `.gitignore` files at the watch roots.
    pub respect_gitignore: bool,

    /// Quiet period per path before its event is released.
    pub debounce: Duration,

    /// Maximum events per batch.
    pub batch_size: usize,

    /// Maximum time a batch stays open.
    pub batch_timeout: Duration,

    /// Capacity of the bounded channels between pipeline stages.
    pub queue_capacity: usize,

    /// Files indexed concurrently within one batch.
    pub file_concurrency: usize,

    /// Concurrent requests to the embedding service.
    pub embed_concurrency: usize,

    /// Retry settings for transient embedding and storage failures.
    pub retry: RetryPolicy,

    /// OpenAI-compatible embeddings endpoint. `None` selects the hashing embedder.
    pub embed_url: Option<String>,

    /// Model name sent to the embedding endpoint.
    pub embed_model: String,

    /// Bearer token for the embedding endpoint.
    pub embed_api_key: Option<String>,

    /// Dimensionality every stored vector must have.
    pub embed_dim: usize,

    /// Per-request timeout for the embedding endpoint.
    pub embed_timeout: Duration,

    /// Default combination of keyword terms.
    pub keyword_mode: KeywordMode,

    /// Handling of files without a chunking strategy.
    pub unknown_filetypes: UnknownFiletypePolicy,

    /// Files larger than this are not indexed.
    pub max_file_bytes: u64,

    /// Upper bound applied to query limits.
    pub max_query_limit: usize,

    /// How long shutdown waits for in-flight work.
    pub shutdown_grace: Duration,

    /// Line-based chunk sizing.
    pub chunker: ChunkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            watch_roots: Vec::new(),
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS.iter().map(ToString::to_string).collect(),
            respect_gitignore: false,
            debounce: Duration::from_millis(500),
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
            queue_capacity: 1024,
            file_concurrency: 4,
            embed_concurrency: std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(4),
            retry: RetryPolicy::default(),
            embed_url: None,
            embed_model: "text-embedding-3-small".to_string(),
            embed_api_key: None,
            embed_dim: 384,
            embed_timeout: Duration::from_secs(30),
            keyword_mode: KeywordMode::Any,
            unknown_filetypes: UnknownFiletypePolicy::Window,
            max_file_bytes: 2 * 1024 * 1024,
            max_query_limit: 100,
            shutdown_grace: Duration::from_secs(30),
            chunker: ChunkerConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration values.
    ///
    /// Exclusion patterns are compiled here so a malformed glob fails at
    /// load time rather than on the first event.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("port cannot be 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.host.is_empty() {
            return Err(Error::config("host cannot be empty"));
        }

        if self.watch_roots.is_empty() {
            return Err(Error::config("at least one watch root is required"));
        }

        for root in &self.watch_roots {
            if !root.is_absolute() {
                return Err(Error::config(format!(
                    "watch root '{}' must be an absolute path",
                    root.display()
                )));
            }
        }

        if self.batch_size == 0 {
            return Err(Error::config("batch_size cannot be 0"));
        }

        if self.batch_timeout.is_zero() {
            return Err(Error::config("batch_timeout cannot be 0"));
        }

        if self.queue_capacity == 0 {
            return Err(Error::config("queue_capacity cannot be 0"));
        }

        if self.file_concurrency == 0 || self.embed_concurrency == 0 {
            return Err(Error::config(
                "file_concurrency and embed_concurrency cannot be 0",
            ));
        }

        if self.embed_concurrency > 64 {
            return Err(Error::config("embed_concurrency cannot exceed 64"));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry attempts cannot be 0"));
        }

        if self.embed_dim == 0 {
            return Err(Error::config("embed_dim cannot be 0"));
        }

        if self.max_query_limit == 0 {
            return Err(Error::config("max_query_limit cannot be 0"));
        }

        self.chunker.validate()?;
        self.path_filter()?;

        Ok(())
    }

    /// Build the path filter for the configured roots and patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is malformed.
    pub fn path_filter(&self) -> Result<PathFilter> {
        let filter = PathFilter::new(&self.watch_roots, &self.exclude_patterns)?;
        if self.respect_gitignore {
            Ok(filter.with_gitignore())
        } else {
            Ok(filter)
        }
    }

    /// Get the path to the `SQLite` database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("dirindex.db")
    }

    /// Get the server address as a string.
    #[must_use]
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
