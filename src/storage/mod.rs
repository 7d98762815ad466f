//! `SQLite` storage with `sqlite-vec` for vector search.
//!
//! This module provides persistent storage for:
//! - Document chunks with optional embeddings
//! - File state for incremental indexing
//!
//! The rest of the crate goes through the [`ChunkStore`] trait.

mod chunks;
mod connection;
mod file_state;
mod models;
mod schema;
mod search;
mod store;
mod vector;

pub use chunks::{
    count_index, delete_chunk, delete_chunks_by_file, get_chunks_by_file, list_files, upsert_chunk,
};
pub use connection::Database;
pub use file_state::{delete_file_state, get_file_state, list_known_paths, upsert_file_state};
pub use models::{
    compute_hash, now_millis, ChunkChanges, ChunkFilter, ChunkRecord, FileState, IndexCounts,
    SearchResult,
};
pub use schema::{migrate, verify_schema, SCHEMA_VERSION};
pub use search::{filter_chunks, search_chunks};
pub use store::{ChunkStore, RenameTarget, SqliteStore};
pub use vector::{blob_to_vector, init_sqlite_vec, load_extension, vector_to_blob};

/// Initialize storage with migrations.
///
/// # Errors
///
/// Returns an error if the vector extension is missing or a migration fails.
pub fn init_storage(db: &Database) -> crate::Result<()> {
    db.with_conn(|conn| {
        load_extension(conn)?;
        migrate(conn)?;
        verify_schema(conn)?;

        tracing::info!("Storage initialized, schema version {SCHEMA_VERSION}");
        Ok(())
    })
}
