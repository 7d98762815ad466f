//! Tests for error types.

#[cfg(test)]
mod tests {
    use super::super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("invalid port");
        assert_eq!(err.to_string(), "configuration error: invalid port");
    }

    #[test]
    fn test_storage_error_not_found() {
        let err = StorageError::not_found("chunk", "/src/a.py#0");
        assert_eq!(err.to_string(), "not found: chunk with id '/src/a.py#0'");
    }

    #[test]
    fn test_storage_error_conversion() {
        let storage_err = StorageError::Database("connection failed".to_string());
        let err: Error = storage_err.into();
        assert!(matches!(err, Error::Storage(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_busy_storage_is_transient() {
        let err: Error = StorageError::Busy("database is locked".to_string()).into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_rusqlite_busy_maps_to_busy() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let err = StorageError::from(sqlite_err);
        assert!(matches!(err, StorageError::Busy(_)));
    }

    #[test]
    fn test_rusqlite_other_maps_to_database() {
        let err = StorageError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, StorageError::Database(_)));
    }

    #[test]
    fn test_embedding_error_classification() {
        assert!(EmbeddingError::Transient("timeout".to_string()).is_transient());
        assert!(!EmbeddingError::Permanent("too long".to_string()).is_transient());
        assert!(!EmbeddingError::DimensionMismatch {
            expected: 384,
            actual: 768
        }
        .is_transient());
    }

    #[test]
    fn test_embedding_error_display() {
        let err = EmbeddingError::DimensionMismatch {
            expected: 384,
            actual: 768,
        };
        assert_eq!(
            err.to_string(),
            "embedding dimension mismatch: expected 384, got 768"
        );
    }

    #[test]
    fn test_embedding_error_conversion() {
        let emb_err = EmbeddingError::Permanent("input too large".to_string());
        let err: Error = emb_err.into();
        assert!(matches!(err, Error::Embedding(_)));
    }

    #[test]
    fn test_filter_error_display() {
        let err = FilterError::InvalidPattern {
            pattern: "[abc".to_string(),
            reason: "unclosed character class".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid exclusion pattern '[abc': unclosed character class"
        );
        let err: Error = err.into();
        assert!(matches!(err, Error::Filter(_)));
    }

    #[test]
    fn test_watcher_error_conversion() {
        let watch_err = WatcherError::WatchFailed {
            path: "/tmp/test".to_string(),
            reason: "permission denied".to_string(),
        };
        let err: Error = watch_err.into();
        assert!(matches!(err, Error::Watcher(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_chunk_error_too_large() {
        let err = ChunkError::TooLarge {
            path: "/data/dump.sql".to_string(),
            size: 10,
            limit: 5,
        };
        assert_eq!(
            err.to_string(),
            "file '/data/dump.sql' is 10 bytes, limit is 5"
        );
    }

    #[test]
    fn test_index_error_from_storage() {
        let busy = StorageError::Busy("locked".to_string());
        assert!(matches!(
            IndexError::from_storage("/a.py", &busy),
            IndexError::Transient { .. }
        ));

        let broken = StorageError::Vector("bad blob".to_string());
        let err = IndexError::from_storage("/a.py", &broken);
        assert!(matches!(err, IndexError::Permanent { .. }));
        assert_eq!(
            err.to_string(),
            "permanent index failure for '/a.py': vector error: bad blob"
        );
    }

    #[test]
    fn test_query_error_display() {
        let err: Error = QueryError::NotFound("/missing.rs".to_string()).into();
        assert_eq!(err.to_string(), "query error: not found: /missing.rs");

        let err = QueryError::InvalidQuery("limit must be positive".to_string());
        assert_eq!(err.to_string(), "invalid query: limit must be positive");
    }

    #[test]
    fn test_server_error_conversion() {
        let server_err = ServerError::BindFailed {
            address: "127.0.0.1:8080".to_string(),
            reason: "address in use".to_string(),
        };
        let err: Error = server_err.into();
        assert!(matches!(err, Error::Server(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_internal() {
        let err = Error::internal("test internal error");
        assert_eq!(err.to_string(), "internal error: test internal error");
    }

    #[test]
    fn test_error_propagation_with_question_mark() {
        fn inner() -> Result<i32> {
            Err(QueryError::InvalidQuery("empty terms".to_string()))?
        }

        fn outer() -> Result<i32> {
            let _ = inner()?;
            Ok(0)
        }

        let result = outer();
        assert_eq!(
            result.unwrap_err().to_string(),
            "query error: invalid query: empty terms"
        );
    }
}
