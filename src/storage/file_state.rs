//! File state storage for incremental indexing.

use rusqlite::{Connection, OptionalExtension};

use super::models::FileState;
use crate::error::StorageError;
use crate::Result;

/// Get file state by path.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_file_state(conn: &Connection, path: &str) -> Result<Option<FileState>> {
    conn.query_row(
        "SELECT path, mtime, size, hash, last_indexed FROM file_state WHERE path = ?",
        [path],
        |row| {
            Ok(FileState {
                path: row.get(0)?,
                mtime: row.get(1)?,
                size: row.get(2)?,
                hash: row.get(3)?,
                last_indexed: row.get(4)?,
            })
        },
    )
    .optional()
    .map_err(|e| StorageError::from(e).into())
}

/// Update or insert file state.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn upsert_file_state(conn: &Connection, state: &FileState) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO file_state (path, mtime, size, hash, last_indexed) VALUES (?, ?, ?, ?, ?)",
        rusqlite::params![state.path, state.mtime, state.size, state.hash, state.last_indexed],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// Delete file state.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn delete_file_state(conn: &Connection, path: &str) -> Result<()> {
    conn.execute("DELETE FROM file_state WHERE path = ?", [path])
        .map_err(StorageError::from)?;
    Ok(())
}

/// Delete file state for every path starting with `prefix`.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn delete_file_state_under(conn: &Connection, prefix: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM file_state WHERE substr(path, 1, length(?1)) = ?1",
        [prefix],
    )
    .map_err(|e| StorageError::from(e).into())
}

/// Move file state to a new path, replacing any state already there.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn rename_file_state(conn: &Connection, from: &str, to: &str) -> Result<bool> {
    delete_file_state(conn, to)?;
    let rows = conn
        .execute("UPDATE file_state SET path = ? WHERE path = ?", [to, from])
        .map_err(StorageError::from)?;
    Ok(rows > 0)
}

/// Every path that has chunks or file state.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn list_known_paths(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT path FROM file_state
             UNION
             SELECT DISTINCT file_path FROM chunks
             ORDER BY 1",
        )
        .map_err(StorageError::from)?;

    let paths = stmt
        .query_map([], |row| row.get(0))
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;

    Ok(paths)
}
