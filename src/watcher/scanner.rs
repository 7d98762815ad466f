//! Startup scan and stale-entry pruning.
//!
//! The scan walks every root and feeds a `Created` event per tracked file
//! into the normal debounce path. Pruning drops stored paths that vanished
//! or became excluded while the process was down.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ignore::WalkBuilder;
use tokio::sync::mpsc;

use super::events::ChangeEvent;
use super::filter::PathFilter;
use crate::storage::ChunkStore;
use crate::Result;

/// Scan statistics.
#[derive(Debug, Default)]
pub struct ScanStats {
    pub files_found: AtomicU64,
    pub files_queued: AtomicU64,
    pub files_skipped: AtomicU64,
    pub errors: AtomicU64,
}

impl ScanStats {
    /// Create new stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of current stats.
    #[must_use]
    pub fn snapshot(&self) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            files_found: self.files_found.load(Ordering::Relaxed),
            files_queued: self.files_queued.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of scan stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStatsSnapshot {
    pub files_found: u64,
    pub files_queued: u64,
    pub files_skipped: u64,
    pub errors: u64,
}

/// Walk every root and queue a `Created` event per tracked file.
///
/// Blocks on a full channel; run it off the async workers.
pub fn scan_roots(filter: &Arc<PathFilter>, tx: &mpsc::Sender<ChangeEvent>) -> ScanStatsSnapshot {
    let stats = ScanStats::new();

    for root in filter.roots() {
        tracing::info!(path = %root.display(), "Starting directory scan");

        let entry_filter = Arc::clone(filter);
        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| entry.depth() == 0 || entry_filter.should_track(entry.path()))
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Error walking directory");
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            stats.files_found.fetch_add(1, Ordering::Relaxed);

            if !filter.should_track(entry.path()) {
                stats.files_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if tx.blocking_send(ChangeEvent::created(entry.path())).is_err() {
                tracing::warn!("Event channel closed during scan");
                return stats.snapshot();
            }
            stats.files_queued.fetch_add(1, Ordering::Relaxed);
        }
    }

    let snapshot = stats.snapshot();
    tracing::info!(
        found = snapshot.files_found,
        queued = snapshot.files_queued,
        skipped = snapshot.files_skipped,
        errors = snapshot.errors,
        "Directory scan complete"
    );
    snapshot
}

/// Async version of [`scan_roots`].
///
/// # Errors
///
/// Returns an error if the blocking scan task panics.
pub async fn scan_roots_async(
    filter: Arc<PathFilter>,
    tx: mpsc::Sender<ChangeEvent>,
) -> Result<ScanStatsSnapshot> {
    tokio::task::spawn_blocking(move || scan_roots(&filter, &tx))
        .await
        .map_err(|e| crate::Error::internal(format!("Scan task failed: {e}")))
}

/// Remove stored paths that no longer exist or are no longer tracked.
/// Returns the number of paths removed.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub fn prune_stale(store: &dyn ChunkStore, filter: &PathFilter) -> Result<usize> {
    let mut pruned = 0;

    for path in store.indexed_paths()? {
        let on_disk = Path::new(&path);
        let reason = if !filter.should_track(on_disk) {
            "excluded"
        } else if !on_disk.is_file() {
            "missing"
        } else {
            continue;
        };

        let removed = store.remove_path(&path)?;
        tracing::info!(path = %path, reason, files = removed.len(), "Pruned stale path");
        pruned += 1;
    }

    if pruned > 0 {
        tracing::info!(pruned, "Stale entries pruned");
    }
    Ok(pruned)
}
