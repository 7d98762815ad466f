//! The running ingestion pipeline.
//!
//! notify callback → watcher drain task → debouncer task → batch consumer,
//! joined by bounded channels. The consumer takes one batch at a time and
//! indexes its files concurrently, keeping events on overlapping paths in
//! order.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::indexer::{IndexOutcome, Indexer, ReconcileReport};
use crate::config::Config;
use crate::embeddings::EmbeddingService;
use crate::error::Error;
use crate::storage::ChunkStore;
use crate::watcher::{
    prune_stale, scan_roots_async, ChangeEvent, ChangeWatcher, DebounceConfig, Debouncer,
    EventBatch, PathFilter, ScanStatsSnapshot, WatchHealth,
};
use crate::Result;

/// Counts for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub events: usize,
    pub reconciled: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Entry point for starting the pipeline.
#[derive(Debug)]
pub struct Pipeline;

impl Pipeline {
    /// Start watching, scanning and indexing the configured roots.
    ///
    /// Before any event is processed, chunks with a foreign vector
    /// dimension are dropped and paths that vanished or became excluded
    /// are pruned. The startup scan runs after the watches are in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter cannot be built, the store cannot be
    /// cleaned up, or the watch backend fails to start.
    pub fn start(
        config: &Config,
        store: Arc<dyn ChunkStore>,
        embedder: EmbeddingService,
    ) -> Result<PipelineHandle> {
        let filter = Arc::new(config.path_filter()?);

        let purged = store.purge_dimension_mismatch(config.embed_dim)?;
        if !purged.is_empty() {
            tracing::warn!(
                files = purged.len(),
                dimension = config.embed_dim,
                "Dropped chunks with a different embedding dimension"
            );
        }

        let pruned = prune_stale(store.as_ref(), &filter)?;
        if pruned > 0 {
            tracing::info!(files = pruned, "Pruned stale index entries");
        }

        let indexer = Arc::new(Indexer::from_config(config, store, embedder));
        let capacity = config.queue_capacity;
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);

        let watcher = ChangeWatcher::start(Arc::clone(&filter), event_tx.clone(), capacity)?;
        let health = watcher.health();
        let registered = watcher.registered();

        let debouncer = tokio::spawn(
            Debouncer::new(DebounceConfig::from(config)).run(event_rx, batch_tx),
        );
        let consumer = tokio::spawn(consume(
            Arc::clone(&indexer),
            batch_rx,
            config.file_concurrency,
        ));

        let cancel = CancellationToken::new();
        let scan = tokio::spawn(run_scan(filter, registered, event_tx, capacity, cancel.clone()));

        tracing::info!(
            roots = config.watch_roots.len(),
            file_concurrency = config.file_concurrency,
            "Indexing pipeline started"
        );

        Ok(PipelineHandle {
            indexer,
            watcher: Some(watcher),
            health,
            cancel,
            scan: Some(scan),
            debouncer,
            consumer,
        })
    }
}

/// Owner of the pipeline's tasks.
pub struct PipelineHandle {
    indexer: Arc<Indexer>,
    watcher: Option<ChangeWatcher>,
    health: watch::Receiver<WatchHealth>,
    cancel: CancellationToken,
    scan: Option<JoinHandle<Result<ScanStatsSnapshot>>>,
    debouncer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl PipelineHandle {
    /// Watch health, for `/health`.
    #[must_use]
    pub fn health(&self) -> watch::Receiver<WatchHealth> {
        self.health.clone()
    }

    /// Receive every reconcile report.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileReport> {
        self.indexer.subscribe()
    }

    /// The indexer behind the consumer.
    #[must_use]
    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// Wait for the startup scan to finish queueing events.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan task failed or was already awaited.
    pub async fn scan_complete(&mut self) -> Result<ScanStatsSnapshot> {
        let scan = self
            .scan
            .take()
            .ok_or_else(|| Error::internal("startup scan already awaited"))?;
        scan.await
            .map_err(|e| Error::internal(format!("Scan task failed: {e}")))?
    }

    /// Stop the pipeline.
    ///
    /// Watches are removed and the scan stops feeding events. The debouncer
    /// flushes what it holds and the consumer works through it until
    /// `grace` elapses; anything still running then is aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        tracing::info!(grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "Stopping pipeline");
        self.cancel.cancel();

        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown().await;
        }
        if let Some(scan) = self.scan.take() {
            if let Err(e) = scan.await {
                tracing::warn!(error = %e, "Scan task ended abnormally");
            }
        }

        let drain = async {
            let _ = (&mut self.debouncer).await;
            let _ = (&mut self.consumer).await;
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("Grace period elapsed, aborting in-flight indexing");
            self.debouncer.abort();
            self.consumer.abort();
        }

        tracing::info!("Pipeline stopped");
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("indexer", &self.indexer)
            .field("health", &*self.health.borrow())
            .finish_non_exhaustive()
    }
}

/// Once the watches are registered, forward scan events into the pipeline
/// until the walk ends or `cancel` fires. Dropping the receiver stops the
/// blocking walk at its next send.
async fn run_scan(
    filter: Arc<PathFilter>,
    mut registered: watch::Receiver<bool>,
    out: mpsc::Sender<ChangeEvent>,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<ScanStatsSnapshot> {
    match cancel.run_until_cancelled(registered.wait_for(|done| *done)).await {
        None => {
            tracing::info!("Startup scan cancelled before watches were registered");
            return Ok(ScanStatsSnapshot::default());
        }
        Some(Err(_)) => tracing::warn!("Watcher stopped before registering, scanning anyway"),
        Some(Ok(_)) => {}
    }

    let (tx, mut rx) = mpsc::channel(capacity);
    let walk = tokio::spawn(scan_roots_async(filter, tx));

    let forward = async {
        while let Some(event) = rx.recv().await {
            if out.send(event).await.is_err() {
                break;
            }
        }
    };
    if cancel.run_until_cancelled(forward).await.is_none() {
        tracing::info!("Startup scan cancelled");
    }
    drop(rx);

    walk.await
        .map_err(|e| Error::internal(format!("Scan task failed: {e}")))?
}

async fn consume(indexer: Arc<Indexer>, mut batches: mpsc::Receiver<EventBatch>, concurrency: usize) {
    tracing::debug!("Batch consumer started");

    while let Some(batch) = batches.recv().await {
        let summary = process_batch(&indexer, batch, concurrency).await;
        tracing::debug!(
            events = summary.events,
            reconciled = summary.reconciled,
            unchanged = summary.unchanged,
            removed = summary.removed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Processed batch"
        );
    }

    tracing::debug!("Batch channel closed, consumer stopping");
}

/// Index every event of `batch`, at most `concurrency` at a time, started
/// in release order. Events touching overlapping paths, including a
/// rename's source, run one after another. Failures are logged and
/// counted; they never stop the batch.
pub async fn process_batch(indexer: &Indexer, batch: EventBatch, concurrency: usize) -> BatchSummary {
    let mut summary = BatchSummary {
        events: batch.len(),
        ..BatchSummary::default()
    };

    let mut results: Vec<(ChangeEvent, Result<IndexOutcome>)> = Vec::with_capacity(summary.events);
    for wave in batch.into_waves() {
        let done: Vec<_> = stream::iter(wave)
            .map(|event| async move {
                let result = indexer.handle(&event).await;
                (event, result)
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;
        results.extend(done);
    }

    for (event, result) in results {
        match result {
            Ok(IndexOutcome::Reconciled(_)) => summary.reconciled += 1,
            Ok(IndexOutcome::Unchanged) => summary.unchanged += 1,
            Ok(IndexOutcome::Removed(_)) => summary.removed += 1,
            Ok(IndexOutcome::Skipped) => summary.skipped += 1,
            Err(Error::Chunk(e)) => {
                tracing::info!(path = %event.path.display(), reason = %e, "Skipping file");
                summary.skipped += 1;
            }
            Err(e) => {
                tracing::error!(
                    path = %event.path.display(),
                    kind = event.kind.label(),
                    error = %e,
                    "Failed to index file"
                );
                summary.failed += 1;
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::embeddings::HashEmbedder;
    use crate::indexer::{Chunker, ChunkerConfig};
    use crate::storage::{init_storage, Database, SqliteStore};
    use std::fs;
    use tempfile::TempDir;

    const DIM: usize = 16;

    fn store() -> Arc<dyn ChunkStore> {
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        SqliteStore::shared(db)
    }

    fn service() -> EmbeddingService {
        EmbeddingService::new(Arc::new(HashEmbedder::new(DIM)), RetryPolicy::immediate(1), 2, DIM)
    }

    fn indexer(store: Arc<dyn ChunkStore>) -> Indexer {
        Indexer::new(
            store,
            service(),
            Chunker::new(ChunkerConfig::default(), Default::default()),
            RetryPolicy::immediate(1),
            1024,
        )
    }

    #[tokio::test]
    async fn test_process_batch_counts_outcomes() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.md");
        let binary = tmp.path().join("blob.bin");
        let gone = tmp.path().join("gone.txt");
        fs::write(&good, "# Title\n\nbody\n").unwrap();
        fs::write(&binary, b"\x00\x00\x00").unwrap();

        let store = store();
        let indexer = indexer(Arc::clone(&store));
        let mut batch = EventBatch::new();
        batch.push(ChangeEvent::created(&good));
        batch.push(ChangeEvent::created(&binary));
        batch.push(ChangeEvent::deleted(&gone));

        let summary = process_batch(&indexer, batch, 2).await;

        assert_eq!(summary.events, 3);
        assert_eq!(summary.reconciled, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(store.count().unwrap().files, 1);
    }

    #[tokio::test]
    async fn test_rename_source_reused_in_same_batch() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("a.md");
        let moved = tmp.path().join("b.md");
        let sections = |tag: &str| -> String {
            (0..6)
                .map(|i| format!("# {tag} {i}\n\n{}\n\n", format!("{tag} body {i} ").repeat(3)))
                .collect()
        };
        fs::write(&old, sections("old")).unwrap();

        let store = store();
        let indexer = indexer(Arc::clone(&store));
        indexer.index_path(&old).await.unwrap();
        let before = store.get_by_path(&old.to_string_lossy()).unwrap().len();
        assert!(before > 1);

        fs::rename(&old, &moved).unwrap();
        fs::write(&old, sections("new")).unwrap();
        let mut batch = EventBatch::new();
        batch.push(ChangeEvent::renamed(&old, &moved));
        batch.push(ChangeEvent::created(&old));

        let summary = process_batch(&indexer, batch, 4).await;
        assert_eq!(summary.failed, 0);

        let moved_chunks = store.get_by_path(&moved.to_string_lossy()).unwrap();
        assert_eq!(moved_chunks.len(), before);
        assert!(moved_chunks.iter().all(|c| c.content.contains("old")));

        let fresh = store.get_by_path(&old.to_string_lossy()).unwrap();
        let indices: Vec<i32> = fresh.iter().map(|c| c.chunk_index).collect();
        let expected: Vec<i32> = (0..i32::try_from(fresh.len()).unwrap()).collect();
        assert_eq!(indices, expected);
        assert!(fresh.iter().all(|c| c.content.contains("new")));
    }

    #[tokio::test]
    async fn test_pipeline_indexes_existing_and_new_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::write(root.join("a.py"), "def f():\n    return 1\n").unwrap();

        let config = Config {
            watch_roots: vec![root.clone()],
            debounce: Duration::from_millis(20),
            batch_timeout: Duration::from_millis(50),
            embed_dim: DIM,
            ..Config::default()
        };
        let store = store();
        let mut handle = Pipeline::start(&config, Arc::clone(&store), service()).unwrap();
        let mut reports = handle.subscribe();

        let scanned = handle.scan_complete().await.unwrap();
        assert_eq!(scanned.files_queued, 1);

        let first = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.filepath.ends_with("a.py"));

        fs::write(root.join("b.md"), "# Notes\n\nhello\n").unwrap();
        let second = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(second.filepath.ends_with("b.md"));

        handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(store.count().unwrap().files, 2);
    }

    #[tokio::test]
    async fn test_startup_prunes_vanished_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let store = store();
        let ghost = root.join("ghost.txt");
        fs::write(&ghost, "boo\n").unwrap();
        indexer(Arc::clone(&store)).index_path(&ghost).await.unwrap();
        fs::remove_file(&ghost).unwrap();

        let config = Config {
            watch_roots: vec![root],
            embed_dim: DIM,
            ..Config::default()
        };
        let mut handle = Pipeline::start(&config, Arc::clone(&store), service()).unwrap();
        handle.scan_complete().await.unwrap();

        assert_eq!(store.count().unwrap().chunks, 0);
        handle.shutdown(Duration::from_secs(5)).await;
    }
}
