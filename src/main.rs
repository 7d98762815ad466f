//! dirindex - live semantic index of a directory tree
//!
//! Entry point for the dirindex server.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dirindex::config::{KeywordMode, RetryPolicy, UnknownFiletypePolicy, DEFAULT_EXCLUDE_PATTERNS};
use dirindex::embeddings::EmbeddingService;
use dirindex::indexer::Pipeline;
use dirindex::query::QueryPlanner;
use dirindex::server::{init_metrics, init_tracing, shutdown_signal, App, AppState, ServerConfig};
use dirindex::storage::{init_storage, Database, SqliteStore};
use dirindex::{Config, Result};

/// dirindex - live semantic index of a directory tree
#[derive(Parser, Debug)]
#[command(name = "dirindex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directories to index (comma or colon separated)
    #[arg(short, long, env = "DIRINDEX_WATCH_PATHS", value_delimiter = ',')]
    watch: Vec<String>,

    /// Exclusion globs (comma separated)
    #[arg(long, env = "DIRINDEX_EXCLUDE_PATTERNS", value_delimiter = ',')]
    exclude: Vec<String>,

    /// Also honor .gitignore files
    #[arg(long, env = "DIRINDEX_RESPECT_GITIGNORE")]
    respect_gitignore: bool,

    /// Data directory for `SQLite` database
    #[arg(short, long, env = "DIRINDEX_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Host address to bind to
    #[arg(long, env = "DIRINDEX_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "DIRINDEX_PORT", default_value = "8080")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DIRINDEX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, env = "DIRINDEX_LOG_JSON")]
    log_json: bool,

    /// Quiet period per path before indexing, in milliseconds
    #[arg(long, env = "DIRINDEX_DEBOUNCE_MS", default_value = "500")]
    debounce_ms: u64,

    /// Maximum files per batch
    #[arg(long, env = "DIRINDEX_BATCH_SIZE", default_value = "10")]
    batch_size: usize,

    /// Maximum time a batch stays open, in milliseconds
    #[arg(long, env = "DIRINDEX_BATCH_TIMEOUT_MS", default_value = "5000")]
    batch_timeout_ms: u64,

    /// Files indexed concurrently
    #[arg(long, env = "DIRINDEX_FILE_CONCURRENCY", default_value = "4")]
    file_concurrency: usize,

    /// Concurrent embedding requests
    #[arg(long, env = "DIRINDEX_EMBED_CONCURRENCY", default_value = "4")]
    embed_concurrency: usize,

    /// Attempts for transient embedding and storage failures
    #[arg(long, env = "DIRINDEX_RETRY_ATTEMPTS", default_value = "5")]
    retry_attempts: u32,

    /// First retry delay, in milliseconds
    #[arg(long, env = "DIRINDEX_RETRY_BASE_MS", default_value = "200")]
    retry_base_ms: u64,

    /// OpenAI-compatible embeddings endpoint; unset uses local hashing
    #[arg(long, env = "DIRINDEX_EMBED_URL")]
    embed_url: Option<String>,

    /// Embedding model name
    #[arg(long, env = "DIRINDEX_EMBED_MODEL", default_value = "text-embedding-3-small")]
    embed_model: String,

    /// Bearer token for the embeddings endpoint
    #[arg(long, env = "DIRINDEX_EMBED_API_KEY", hide_env_values = true)]
    embed_api_key: Option<String>,

    /// Embedding dimension
    #[arg(long, env = "DIRINDEX_EMBED_DIM", default_value = "384")]
    embed_dim: usize,

    /// Default keyword combination (any, all)
    #[arg(long, env = "DIRINDEX_KEYWORD_MODE", default_value = "any")]
    keyword_mode: KeywordMode,

    /// Files of unknown type (window, skip)
    #[arg(long, env = "DIRINDEX_UNKNOWN_FILETYPES", default_value = "window")]
    unknown_filetypes: UnknownFiletypePolicy,
}

impl Cli {
    fn into_config(self) -> Config {
        let watch_roots = self
            .watch
            .iter()
            .flat_map(|entry| entry.split(':'))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();

        let exclude_patterns = if self.exclude.is_empty() {
            DEFAULT_EXCLUDE_PATTERNS.iter().map(ToString::to_string).collect()
        } else {
            self.exclude
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        };

        let defaults = Config::default();
        Config {
            data_dir: self.data_dir,
            host: self.host,
            port: self.port,
            log_level: self.log_level,
            watch_roots,
            exclude_patterns,
            respect_gitignore: self.respect_gitignore,
            debounce: Duration::from_millis(self.debounce_ms),
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            file_concurrency: self.file_concurrency,
            embed_concurrency: self.embed_concurrency,
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                base_delay: Duration::from_millis(self.retry_base_ms),
                ..defaults.retry
            },
            embed_url: self.embed_url.filter(|u| !u.trim().is_empty()),
            embed_model: self.embed_model,
            embed_api_key: self.embed_api_key,
            embed_dim: self.embed_dim,
            keyword_mode: self.keyword_mode,
            unknown_filetypes: self.unknown_filetypes,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.log_json);
    tracing::info!("dirindex v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = cli.into_config();
    tracing::debug!(?config, "Configuration loaded");
    config.validate()?;

    tracing::info!(
        roots = ?config.watch_roots,
        addr = %config.server_addr(),
        data_dir = %config.data_dir.display(),
        "Configuration validated"
    );

    let db = Database::open(config.database_path())?;
    init_storage(&db)?;
    init_metrics();

    let store = SqliteStore::shared(db);
    let embedder = EmbeddingService::from_config(&config)?;
    let pipeline = Pipeline::start(&config, store.clone(), embedder.clone())?;

    let planner = QueryPlanner::from_config(&config, store, embedder);
    let state = AppState::new(planner).with_watch_health(pipeline.health());
    let app = App::new(ServerConfig::from(&config), state);

    let served = app.run_until(shutdown_signal()).await;
    pipeline.shutdown(config.shutdown_grace).await;
    served
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_builds_config() {
        let cli = Cli::parse_from([
            "dirindex",
            "--watch",
            "/a:/b,/c",
            "--exclude",
            "*.log, target/*",
            "--keyword-mode",
            "all",
            "--debounce-ms",
            "250",
        ]);
        let config = cli.into_config();

        assert_eq!(
            config.watch_roots,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
        assert_eq!(config.exclude_patterns, vec!["*.log", "target/*"]);
        assert_eq!(config.keyword_mode, KeywordMode::All);
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert!(config.embed_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_defaults_exclusions() {
        let config = Cli::parse_from(["dirindex", "-w", "/srv"]).into_config();
        assert_eq!(config.exclude_patterns.len(), DEFAULT_EXCLUDE_PATTERNS.len());
        assert_eq!(config.retry.max_attempts, 5);
    }
}
