//! File system watching.
//!
//! This module provides:
//! - Path filtering against roots and exclusion globs
//! - Per-directory watches using notify-rs, with per-root backoff
//! - Per-path debouncing and bounded batching
//! - The startup scan and stale-entry pruning

mod debouncer;
mod events;
mod filter;
mod scanner;
#[allow(clippy::module_inception)]
mod watcher;

pub use debouncer::{DebounceConfig, Debouncer};
pub use events::{ChangeEvent, ChangeKind, EventBatch};
pub use filter::{normalize, PathFilter};
pub use scanner::{prune_stale, scan_roots, scan_roots_async, ScanStats, ScanStatsSnapshot};
pub use watcher::{backoff_delay, ChangeWatcher, RootState, WatchHealth};
