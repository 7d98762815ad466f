//! Vector support using the sqlite-vec extension.
//!
//! Embeddings live in the `chunks` table as little-endian `f32` blobs.
//! Similarity is computed with sqlite-vec's `vec_distance_cosine` scalar, so
//! pending chunks (NULL embedding) and rows of another dimensionality are
//! excluded with a plain `WHERE` clause.

use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::sync::Once;

use crate::error::StorageError;
use crate::Result;

static INIT: Once = Once::new();

/// Register sqlite-vec for every connection opened afterwards.
///
/// Safe to call repeatedly; registration happens once per process.
#[allow(unsafe_code)]
pub fn init_sqlite_vec() {
    INIT.call_once(|| {
        // SAFETY: `sqlite3_vec_init` is the extension entry point exported by
        // sqlite-vec and has the signature `sqlite3_auto_extension` expects
        // once cast; the Once guard prevents double registration.
        #[allow(clippy::missing_transmute_annotations)]
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec extension registered");
    });
}

/// Verify sqlite-vec is loaded on this connection.
///
/// # Errors
///
/// Returns an error if `vec_version()` is not callable.
pub fn load_extension(conn: &Connection) -> Result<()> {
    conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
        .map(|version| tracing::debug!(version = %version, "sqlite-vec extension verified"))
        .map_err(|e| {
            StorageError::Vector(format!(
                "sqlite-vec extension not available, vector search disabled: {e}"
            ))
            .into()
        })
}

/// Encode a vector for storage.
#[must_use]
pub fn vector_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a stored vector.
///
/// # Errors
///
/// Returns an error if the blob length is not a multiple of four.
pub fn blob_to_vector(blob: &[u8]) -> std::result::Result<Vec<f32>, StorageError> {
    if blob.len() % 4 != 0 {
        return Err(StorageError::Vector(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[test]
    fn test_init_sqlite_vec_idempotent() {
        init_sqlite_vec();
        init_sqlite_vec();
        let db = Database::open_in_memory().unwrap();
        db.with_conn(load_extension).unwrap();
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let original = vec![1.0f32, 2.0, 3.0, -4.5];
        let recovered = blob_to_vector(&vector_to_blob(&original)).unwrap();
        assert_eq!(original, recovered);
    }

    #[test]
    fn test_blob_with_bad_length() {
        assert!(blob_to_vector(&[0u8, 1, 2]).is_err());
    }

    #[test]
    fn test_cosine_distance_scalar() {
        let db = Database::open_in_memory().unwrap();
        let (same, orthogonal): (f32, f32) = db
            .with_conn(|conn| {
                let a = vector_to_blob(&[1.0, 0.0, 0.0, 0.0]);
                let b = vector_to_blob(&[0.0, 1.0, 0.0, 0.0]);
                conn.query_row(
                    "SELECT vec_distance_cosine(?1, ?1), vec_distance_cosine(?1, ?2)",
                    rusqlite::params![a, b],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| StorageError::from(e).into())
            })
            .unwrap();

        assert!(same.abs() < 1e-6);
        assert!((orthogonal - 1.0).abs() < 1e-6);
    }
}
