//! Chunk storage operations.

use rusqlite::{Connection, Row};
use serde_json::{Map, Value};

use super::models::{ChunkRecord, IndexCounts};
use super::vector::{blob_to_vector, vector_to_blob};
use crate::error::StorageError;
use crate::Result;

/// Column list matching [`row_to_chunk`].
pub(crate) const CHUNK_COLUMNS: &str = "id, file_path, chunk_index, start_line, end_line, \
     content, content_hash, filetype, metadata, embedding, created_at, updated_at";

/// Map a row selected with [`CHUNK_COLUMNS`].
pub(crate) fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let metadata: String = row.get(8)?;
    let metadata: Map<String, Value> = serde_json::from_str(&metadata).unwrap_or_default();
    let embedding = row
        .get::<_, Option<Vec<u8>>>(9)?
        .map(|blob| blob_to_vector(&blob))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Blob, Box::new(e))
        })?;

    Ok(ChunkRecord {
        id: Some(row.get(0)?),
        file_path: row.get(1)?,
        chunk_index: row.get(2)?,
        start_line: row.get(3)?,
        end_line: row.get(4)?,
        content: row.get(5)?,
        content_hash: row.get(6)?,
        filetype: row.get(7)?,
        metadata,
        embedding,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Insert a chunk or replace the row at the same `(file_path, chunk_index)`.
///
/// Replacing keeps the row id and `created_at`.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn upsert_chunk(conn: &Connection, chunk: &ChunkRecord) -> Result<i64> {
    let metadata = serde_json::to_string(&chunk.metadata)
        .map_err(|e| StorageError::Database(format!("failed to encode metadata: {e}")))?;
    let blob = chunk.embedding.as_deref().map(vector_to_blob);
    let dim = chunk
        .embedding
        .as_ref()
        .map(|v| i64::try_from(v.len()).unwrap_or(i64::MAX));

    let id = conn
        .query_row(
            "INSERT INTO chunks (file_path, chunk_index, start_line, end_line, content, \
             content_hash, filetype, metadata, embedding, embedding_dim, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(file_path, chunk_index) DO UPDATE SET
                start_line = excluded.start_line,
                end_line = excluded.end_line,
                content = excluded.content,
                content_hash = excluded.content_hash,
                filetype = excluded.filetype,
                metadata = excluded.metadata,
                embedding = excluded.embedding,
                embedding_dim = excluded.embedding_dim,
                updated_at = excluded.updated_at
             RETURNING id",
            rusqlite::params![
                chunk.file_path,
                chunk.chunk_index,
                chunk.start_line,
                chunk.end_line,
                chunk.content,
                chunk.content_hash,
                chunk.filetype,
                metadata,
                blob,
                dim,
                chunk.created_at,
                chunk.updated_at,
            ],
            |row| row.get(0),
        )
        .map_err(StorageError::from)?;

    Ok(id)
}

/// Delete one chunk. Returns whether a row existed.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn delete_chunk(conn: &Connection, file_path: &str, chunk_index: i32) -> Result<bool> {
    let rows = conn
        .execute(
            "DELETE FROM chunks WHERE file_path = ? AND chunk_index = ?",
            rusqlite::params![file_path, chunk_index],
        )
        .map_err(StorageError::from)?;
    Ok(rows > 0)
}

/// All chunks of a file, ordered by chunk index.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_chunks_by_file(conn: &Connection, file_path: &str) -> Result<Vec<ChunkRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_path = ? ORDER BY chunk_index"
        ))
        .map_err(StorageError::from)?;

    let chunks = stmt
        .query_map([file_path], row_to_chunk)
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;

    Ok(chunks)
}

/// Delete every chunk of a file. Returns the number of rows removed.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn delete_chunks_by_file(conn: &Connection, file_path: &str) -> Result<usize> {
    conn.execute("DELETE FROM chunks WHERE file_path = ?", [file_path])
        .map_err(|e| StorageError::from(e).into())
}

/// Delete every chunk whose path starts with `prefix`.
///
/// Returns each removed path with the number of chunks it had.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn delete_chunks_under(conn: &Connection, prefix: &str) -> Result<Vec<(String, usize)>> {
    let mut stmt = conn
        .prepare(
            "SELECT file_path, COUNT(*) FROM chunks
             WHERE substr(file_path, 1, length(?1)) = ?1
             GROUP BY file_path ORDER BY file_path",
        )
        .map_err(StorageError::from)?;
    let paths = stmt
        .query_map([prefix], |row| {
            let count = usize::try_from(row.get::<_, i64>(1)?).unwrap_or(0);
            Ok((row.get::<_, String>(0)?, count))
        })
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;

    conn.execute(
        "DELETE FROM chunks WHERE substr(file_path, 1, length(?1)) = ?1",
        [prefix],
    )
    .map_err(StorageError::from)?;

    Ok(paths)
}

/// Move a file's chunks to a new path without touching content or vectors.
///
/// Updates `filetype`, the `filename`/`directory` metadata keys and
/// `updated_at`. Returns the number of rows moved.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn rename_file_chunks(
    conn: &Connection,
    from: &str,
    to: &str,
    filetype: &str,
    filename: &str,
    directory: &str,
    now: i64,
) -> Result<usize> {
    conn.execute(
        "UPDATE chunks SET
            file_path = ?2,
            filetype = ?3,
            metadata = json_set(metadata, '$.filename', ?4, '$.directory', ?5),
            updated_at = ?6
         WHERE file_path = ?1",
        rusqlite::params![from, to, filetype, filename, directory, now],
    )
    .map_err(|e| StorageError::from(e).into())
}

/// Distinct indexed paths, most recently inserted first.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn list_files(conn: &Connection, limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT file_path FROM chunks GROUP BY file_path ORDER BY MAX(id) DESC LIMIT ?",
        )
        .map_err(StorageError::from)?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let paths = stmt
        .query_map([limit], |row| row.get(0))
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;

    Ok(paths)
}

/// Aggregate counters for the whole index.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn count_index(conn: &Connection) -> Result<IndexCounts> {
    conn.query_row(
        "SELECT COUNT(DISTINCT file_path), COUNT(*),
                COALESCE(SUM(CASE WHEN embedding IS NULL THEN 1 ELSE 0 END), 0),
                MAX(updated_at)
         FROM chunks",
        [],
        |row| {
            Ok(IndexCounts {
                files: row.get::<_, i64>(0)?.unsigned_abs(),
                chunks: row.get::<_, i64>(1)?.unsigned_abs(),
                pending_chunks: row.get::<_, i64>(2)?.unsigned_abs(),
                last_updated: row.get(3)?,
            })
        },
    )
    .map_err(|e| StorageError::from(e).into())
}

/// Delete chunks whose stored vector has the wrong dimensionality.
///
/// Returns the affected file paths so their file state can be cleared.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn purge_dimension_mismatch(conn: &Connection, dim: usize) -> Result<Vec<String>> {
    let dim = i64::try_from(dim).unwrap_or(i64::MAX);
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT file_path FROM chunks
             WHERE embedding_dim IS NOT NULL AND embedding_dim != ?",
        )
        .map_err(StorageError::from)?;
    let paths: Vec<String> = stmt
        .query_map([dim], |row| row.get(0))
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;

    for path in &paths {
        delete_chunks_by_file(conn, path)?;
    }

    Ok(paths)
}

#[cfg(test)]
fn get_chunk(conn: &Connection, file_path: &str, chunk_index: i32) -> Result<Option<ChunkRecord>> {
    use rusqlite::OptionalExtension;

    conn.query_row(
        &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_path = ? AND chunk_index = ?"),
        rusqlite::params![file_path, chunk_index],
        row_to_chunk,
    )
    .optional()
    .map_err(|e| StorageError::from(e).into())
}
