//! Incremental indexing: diff a file's new chunk set against the stored one
//! and write only what changed.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tokio::sync::broadcast;

use super::chunker::{Chunk, Chunker};
use super::filetype::filetype_of;
use crate::config::{Config, RetryPolicy};
use crate::embeddings::EmbeddingService;
use crate::error::{ChunkError, IndexError};
use crate::server::metrics;
use crate::storage::{
    compute_hash, ChunkChanges, ChunkRecord, ChunkStore, FileState, RenameTarget,
};
use crate::watcher::{ChangeEvent, ChangeKind};
use crate::{Error, Result};

/// Buffered reports per subscriber before the slowest one starts lagging.
const REPORT_CHANNEL_CAPACITY: usize = 256;

/// What one reconcile changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub filepath: String,
    pub chunks_added: usize,
    pub chunks_updated: usize,
    pub chunks_removed: usize,
    pub chunks_unchanged: usize,
}

impl ReconcileReport {
    fn new(filepath: &str) -> Self {
        Self {
            filepath: filepath.to_string(),
            ..Self::default()
        }
    }

    /// True if nothing was written besides file state.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.chunks_added == 0 && self.chunks_updated == 0 && self.chunks_removed == 0
    }
}

/// Result of handling one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Chunks were diffed and written.
    Reconciled(ReconcileReport),
    /// Content hash matched the stored one.
    Unchanged,
    /// The path was gone; this many files were dropped from the index.
    Removed(usize),
    /// Not a regular file.
    Skipped,
}

/// Facts about a file captured once per reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub filetype: String,
    /// Unix seconds.
    pub mtime: i64,
    pub size: i64,
    /// blake3 of the raw bytes.
    pub hash: String,
}

impl FileInfo {
    /// Capture metadata for `path` with the given content hash.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn new(path: &Path, metadata: &std::fs::Metadata, hash: String) -> Self {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);

        Self {
            path: path.to_string_lossy().to_string(),
            filetype: filetype_of(path),
            mtime,
            size: metadata.len() as i64,
            hash,
        }
    }

    fn filename(&self) -> String {
        file_name(&self.path)
    }

    fn directory(&self) -> String {
        parent_dir(&self.path)
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    fn record(&self, chunk: &Chunk) -> ChunkRecord {
        ChunkRecord::new(
            &self.path,
            chunk.index as i32,
            chunk.start_line as i32,
            chunk.end_line as i32,
            &chunk.content,
            &self.filetype,
        )
        .with_meta("mtime", self.mtime)
        .with_meta("size", self.size)
        .with_meta("filename", self.filename())
        .with_meta("directory", self.directory())
        .with_meta("file_hash", self.hash.clone())
    }

    fn state(&self) -> FileState {
        FileState::new(&self.path, self.mtime, self.size, &self.hash)
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn parent_dir(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Turns change events into index writes.
pub struct Indexer {
    store: Arc<dyn ChunkStore>,
    embedder: EmbeddingService,
    chunker: Chunker,
    retry: RetryPolicy,
    max_file_bytes: u64,
    events: broadcast::Sender<ReconcileReport>,
}

impl Indexer {
    /// Create a new indexer.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: EmbeddingService,
        chunker: Chunker,
        retry: RetryPolicy,
        max_file_bytes: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            store,
            embedder,
            chunker,
            retry,
            max_file_bytes,
            events,
        }
    }

    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &Config, store: Arc<dyn ChunkStore>, embedder: EmbeddingService) -> Self {
        let chunker = Chunker::new(
            config.chunker,
            super::filetype::FiletypeRegistry::new(config.unknown_filetypes),
        );
        Self::new(store, embedder, chunker, config.retry, config.max_file_bytes)
    }

    /// Receive a copy of every [`ReconcileReport`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileReport> {
        self.events.subscribe()
    }

    /// Apply one debounced event.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation; the file is left for
    /// its next event.
    pub async fn handle(&self, event: &ChangeEvent) -> Result<IndexOutcome> {
        let result = match &event.kind {
            ChangeKind::Created | ChangeKind::Modified => self.index_path(&event.path).await,
            ChangeKind::Deleted => self
                .remove(&event.path.to_string_lossy())
                .map(IndexOutcome::Removed),
            ChangeKind::Renamed { from } => self.rename(from, &event.path).await,
        };

        let label = match &result {
            Ok(IndexOutcome::Reconciled(_)) => "reconciled",
            Ok(IndexOutcome::Unchanged) => "unchanged",
            Ok(IndexOutcome::Removed(_)) => "removed",
            Ok(IndexOutcome::Skipped) => "skipped",
            Err(Error::Chunk(_)) => "skipped",
            Err(_) => "failed",
        };
        metrics::RECONCILES.with_label_values(&[label]).inc();
        result
    }

    /// Read, hash-compare, chunk and reconcile one file.
    ///
    /// A missing file is removed from the index. Oversized and binary files
    /// lose any chunks they had and fail with a [`ChunkError`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or chunked, or the write
    /// fails.
    pub async fn index_path(&self, path: &Path) -> Result<IndexOutcome> {
        let path_str = path.to_string_lossy().to_string();

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return self.remove(&path_str).map(IndexOutcome::Removed);
            }
            Err(e) => {
                return Err(ChunkError::Unreadable {
                    path: path_str,
                    reason: e.to_string(),
                }
                .into());
            }
        };

        if !metadata.is_file() {
            return Ok(IndexOutcome::Skipped);
        }

        if metadata.len() > self.max_file_bytes {
            self.remove(&path_str)?;
            return Err(ChunkError::TooLarge {
                path: path_str,
                size: metadata.len(),
                limit: self.max_file_bytes,
            }
            .into());
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return self.remove(&path_str).map(IndexOutcome::Removed);
            }
            Err(e) => {
                return Err(ChunkError::Unreadable {
                    path: path_str,
                    reason: e.to_string(),
                }
                .into());
            }
        };

        let hash = compute_hash(&bytes);
        if self.store.file_hash(&path_str)?.as_deref() == Some(hash.as_str()) {
            tracing::debug!(path = %path.display(), "File unchanged, skipping");
            return Ok(IndexOutcome::Unchanged);
        }

        let text = match Chunker::decode(path, &bytes) {
            Ok(text) => text,
            Err(e) => {
                self.remove(&path_str)?;
                return Err(e.into());
            }
        };

        let file = FileInfo::new(path, &metadata, hash);
        let chunks = self.chunker.chunk(path, &text, &file.filetype);
        self.reconcile(&file, chunks).await.map(IndexOutcome::Reconciled)
    }

    /// Diff `new_chunks` against the stored chunk set of `file` and write
    /// the difference in one transaction.
    ///
    /// Chunks whose hash already sits at the same index are left alone.
    /// Vectors are reused from the previous chunk set by content hash, and
    /// each remaining distinct hash is embedded once. Chunks whose embedding
    /// fails are stored pending.
    ///
    /// # Errors
    ///
    /// Returns an [`IndexError`] once storage retries are exhausted.
    pub async fn reconcile(&self, file: &FileInfo, new_chunks: Vec<Chunk>) -> Result<ReconcileReport> {
        let existing = self.store.get_by_path(&file.path)?;
        let by_index: HashMap<i32, &ChunkRecord> =
            existing.iter().map(|c| (c.chunk_index, c)).collect();
        let dimension = self.embedder.dimension();
        let known: HashMap<&str, &[f32]> = existing
            .iter()
            .filter_map(|c| {
                c.embedding
                    .as_deref()
                    .filter(|v| v.len() == dimension)
                    .map(|v| (c.content_hash.as_str(), v))
            })
            .collect();

        let mut report = ReconcileReport::new(&file.path);
        let mut upserts = Vec::new();
        for chunk in &new_chunks {
            let record = file.record(chunk);
            match by_index.get(&record.chunk_index) {
                Some(old) if old.content_hash == record.content_hash => {
                    report.chunks_unchanged += 1;
                    continue;
                }
                Some(_) => report.chunks_updated += 1,
                None => report.chunks_added += 1,
            }
            upserts.push(record);
        }

        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let new_count = new_chunks.len() as i32;
        let deletes: Vec<i32> = existing
            .iter()
            .map(|c| c.chunk_index)
            .filter(|index| *index >= new_count)
            .collect();
        report.chunks_removed = deletes.len();

        let mut seen = HashSet::new();
        let to_embed: Vec<&ChunkRecord> = upserts
            .iter()
            .filter(|r| !known.contains_key(r.content_hash.as_str()))
            .filter(|r| seen.insert(r.content_hash.as_str()))
            .collect();
        let texts: Vec<&str> = to_embed.iter().map(|r| r.content.as_str()).collect();
        let results = self.embedder.embed_many(&texts).await;

        let mut fresh: HashMap<String, Vec<f32>> = HashMap::new();
        for (record, result) in to_embed.iter().zip(results) {
            match result {
                Ok(vector) => {
                    fresh.insert(record.content_hash.clone(), vector);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %file.path,
                        chunk_index = record.chunk_index,
                        error = %e,
                        "Embedding failed, storing chunk pending"
                    );
                }
            }
        }

        for record in &mut upserts {
            record.embedding = known
                .get(record.content_hash.as_str())
                .map(|v| v.to_vec())
                .or_else(|| fresh.get(&record.content_hash).cloned());
        }

        let changes = ChunkChanges {
            file_path: file.path.clone(),
            upserts,
            deletes,
            file_state: Some(file.state()),
        };
        self.write(&changes).await?;

        tracing::info!(
            filepath = %report.filepath,
            chunks_added = report.chunks_added,
            chunks_updated = report.chunks_updated,
            chunks_removed = report.chunks_removed,
            chunks_unchanged = report.chunks_unchanged,
            "Reconciled file"
        );
        let _ = self.events.send(report.clone());
        Ok(report)
    }

    /// Drop a file, or every file under a directory, from the index.
    /// Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove(&self, path: &str) -> Result<usize> {
        let removed = self.store.remove_path(path)?;

        for (filepath, chunks) in &removed {
            let report = ReconcileReport {
                filepath: filepath.clone(),
                chunks_removed: *chunks,
                ..ReconcileReport::default()
            };
            tracing::info!(
                filepath = %report.filepath,
                chunks_added = 0,
                chunks_updated = 0,
                chunks_removed = report.chunks_removed,
                chunks_unchanged = 0,
                "Removed file from index"
            );
            let _ = self.events.send(report);
        }

        Ok(removed.len())
    }

    /// Move stored chunks from `from` to `to`, then re-index `to`. The
    /// second step is a no-op when the content did not change.
    ///
    /// # Errors
    ///
    /// Returns an error if the move or the re-index fails.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<IndexOutcome> {
        let to_str = to.to_string_lossy().to_string();
        let target = RenameTarget {
            filetype: filetype_of(to),
            filename: file_name(&to_str),
            directory: parent_dir(&to_str),
            path: to_str,
        };

        let moved = self.store.rename_path(&from.to_string_lossy(), &target)?;
        tracing::info!(
            from = %from.display(),
            to = %to.display(),
            chunks = moved,
            "Renamed file in index"
        );

        self.index_path(to).await
    }

    async fn write(&self, changes: &ChunkChanges) -> Result<()> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.store.apply(changes) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        path = %changes.file_path,
                        attempt = attempt + 1,
                        error = %e,
                        "Index write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(Error::Storage(e)) => {
                    return Err(IndexError::from_storage(&changes.file_path, &e).into());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("embedder", &self.embedder)
            .field("chunker", &self.chunker)
            .field("max_file_bytes", &self.max_file_bytes)
            .finish_non_exhaustive()
    }
}
