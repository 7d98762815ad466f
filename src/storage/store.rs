//! The storage collaborator seen by the indexer and the query planner.
//!
//! Everything above this module talks to [`ChunkStore`]; [`SqliteStore`]
//! implements it on top of [`Database`].

use std::sync::Arc;

use super::chunks::{
    count_index, delete_chunk, delete_chunks_by_file, delete_chunks_under, get_chunks_by_file,
    list_files, purge_dimension_mismatch, rename_file_chunks, upsert_chunk,
};
use super::connection::Database;
use super::file_state::{
    delete_file_state, delete_file_state_under, get_file_state, list_known_paths,
    rename_file_state, upsert_file_state,
};
use super::models::{ChunkChanges, ChunkFilter, ChunkRecord, IndexCounts, SearchResult};
use super::search::{filter_chunks, search_chunks};
use crate::Result;

/// Metadata written when a file moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameTarget {
    /// New absolute path.
    pub path: String,
    /// Filetype derived from the new path.
    pub filetype: String,
    /// Final path component.
    pub filename: String,
    /// Parent directory.
    pub directory: String,
}

/// CRUD and vector-search access to stored chunks.
pub trait ChunkStore: Send + Sync {
    /// Insert or replace one chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn upsert(&self, chunk: &ChunkRecord) -> Result<()>;

    /// Delete one chunk; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn delete(&self, file_path: &str, chunk_index: i32) -> Result<bool>;

    /// All chunks of a file in index order.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_by_path(&self, file_path: &str) -> Result<Vec<ChunkRecord>>;

    /// Nearest embedded chunks to `vector`.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    fn vector_search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult<ChunkRecord>>>;

    /// Chunks matching a structured predicate.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn filter(&self, filter: &ChunkFilter, limit: usize) -> Result<Vec<ChunkRecord>>;

    /// File and chunk counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn count(&self) -> Result<IndexCounts>;

    /// Apply a per-file diff atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is written then.
    fn apply(&self, changes: &ChunkChanges) -> Result<()>;

    /// Remove a file, or every file under it when `path` is a directory.
    /// Returns each removed path with its chunk count.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    fn remove_path(&self, path: &str) -> Result<Vec<(String, usize)>>;

    /// Move a file's chunks and state; returns the number of chunks moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    fn rename_path(&self, from: &str, to: &RenameTarget) -> Result<usize>;

    /// Stored content hash of a file, if it was indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn file_hash(&self, path: &str) -> Result<Option<String>>;

    /// Indexed paths, most recently inserted first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_files(&self, limit: usize) -> Result<Vec<String>>;

    /// Every path the store knows about.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn indexed_paths(&self) -> Result<Vec<String>>;

    /// Drop chunks whose vectors have another dimensionality.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    fn purge_dimension_mismatch(&self, dim: usize) -> Result<Vec<String>>;

    /// Cheap liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn health_check(&self) -> Result<()>;
}

/// [`ChunkStore`] backed by `SQLite` with sqlite-vec.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Wrap an initialized database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Wrap and share.
    #[must_use]
    pub fn shared(db: Database) -> Arc<dyn ChunkStore> {
        Arc::new(Self::new(db))
    }

    /// The underlying database.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }
}

fn dir_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

impl ChunkStore for SqliteStore {
    fn upsert(&self, chunk: &ChunkRecord) -> Result<()> {
        self.db.with_conn(|conn| upsert_chunk(conn, chunk).map(|_| ()))
    }

    fn delete(&self, file_path: &str, chunk_index: i32) -> Result<bool> {
        self.db
            .with_conn(|conn| delete_chunk(conn, file_path, chunk_index))
    }

    fn get_by_path(&self, file_path: &str) -> Result<Vec<ChunkRecord>> {
        self.db.with_conn(|conn| get_chunks_by_file(conn, file_path))
    }

    fn vector_search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchResult<ChunkRecord>>> {
        self.db
            .with_conn(|conn| search_chunks(conn, vector, limit, filter))
    }

    fn filter(&self, filter: &ChunkFilter, limit: usize) -> Result<Vec<ChunkRecord>> {
        self.db.with_conn(|conn| filter_chunks(conn, filter, limit))
    }

    fn count(&self) -> Result<IndexCounts> {
        self.db.with_conn(count_index)
    }

    fn apply(&self, changes: &ChunkChanges) -> Result<()> {
        self.db.with_transaction(|conn| {
            for index in &changes.deletes {
                delete_chunk(conn, &changes.file_path, *index)?;
            }
            for chunk in &changes.upserts {
                upsert_chunk(conn, chunk)?;
            }
            if let Some(state) = &changes.file_state {
                upsert_file_state(conn, state)?;
            }
            Ok(())
        })
    }

    fn remove_path(&self, path: &str) -> Result<Vec<(String, usize)>> {
        self.db.with_transaction(|conn| {
            let mut removed = Vec::new();
            let count = delete_chunks_by_file(conn, path)?;
            if count > 0 {
                removed.push((path.to_string(), count));
            }
            delete_file_state(conn, path)?;

            let prefix = dir_prefix(path);
            removed.extend(delete_chunks_under(conn, &prefix)?);
            delete_file_state_under(conn, &prefix)?;
            Ok(removed)
        })
    }

    fn rename_path(&self, from: &str, to: &RenameTarget) -> Result<usize> {
        let now = super::models::now_millis();
        self.db.with_transaction(|conn| {
            delete_chunks_by_file(conn, &to.path)?;
            let moved = rename_file_chunks(
                conn,
                from,
                &to.path,
                &to.filetype,
                &to.filename,
                &to.directory,
                now,
            )?;
            rename_file_state(conn, from, &to.path)?;
            Ok(moved)
        })
    }

    fn file_hash(&self, path: &str) -> Result<Option<String>> {
        self.db
            .with_conn(|conn| Ok(get_file_state(conn, path)?.map(|state| state.hash)))
    }

    fn list_files(&self, limit: usize) -> Result<Vec<String>> {
        self.db.with_conn(|conn| list_files(conn, limit))
    }

    fn indexed_paths(&self) -> Result<Vec<String>> {
        self.db.with_conn(list_known_paths)
    }

    fn purge_dimension_mismatch(&self, dim: usize) -> Result<Vec<String>> {
        self.db.with_transaction(|conn| {
            let paths = purge_dimension_mismatch(conn, dim)?;
            for path in &paths {
                delete_file_state(conn, path)?;
            }
            Ok(paths)
        })
    }

    fn health_check(&self) -> Result<()> {
        self.db.health_check()
    }
}
