//! Data models for storage operations.
//!
//! This module defines the core data structures used for:
//! - Document chunks with embeddings
//! - File state tracking
//! - Search filters and results

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::KeywordMode;

/// Current time as Unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Hex-encoded blake3 digest.
#[must_use]
pub fn compute_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// One chunk of an indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Database primary key. Grows with insertion order.
    pub id: Option<i64>,

    /// Absolute path of the source file.
    pub file_path: String,

    /// Position within the file (0-based, contiguous).
    pub chunk_index: i32,

    /// First covered line (1-based).
    pub start_line: i32,

    /// Last covered line (1-based, inclusive).
    pub end_line: i32,

    /// Chunk text. Never empty.
    pub content: String,

    /// Digest of `content`.
    pub content_hash: String,

    /// Lower-cased extension, or `"unknown"`.
    pub filetype: String,

    /// Open metadata object (`lines`, `mtime`, `size`, `filename`, ...).
    pub metadata: Map<String, Value>,

    /// Embedding vector, absent while the chunk is pending.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,

    /// Unix milliseconds when the row was first written.
    pub created_at: i64,

    /// Unix milliseconds of the last write.
    pub updated_at: i64,
}

impl ChunkRecord {
    /// Create a new chunk record. The content hash is derived from `content`.
    #[must_use]
    pub fn new(
        file_path: impl Into<String>,
        chunk_index: i32,
        start_line: i32,
        end_line: i32,
        content: impl Into<String>,
        filetype: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let now = now_millis();
        let mut metadata = Map::new();
        metadata.insert("lines".to_string(), Value::from(vec![start_line, end_line]));

        Self {
            id: None,
            file_path: file_path.into(),
            chunk_index,
            start_line,
            end_line,
            content_hash: compute_hash(content.as_bytes()),
            content,
            filetype: filetype.into(),
            metadata,
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set a metadata key.
    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Set the embedding vector.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// True while no embedding is stored.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.embedding.is_none()
    }

    /// Get line count for this chunk.
    #[must_use]
    pub const fn line_count(&self) -> i32 {
        self.end_line - self.start_line + 1
    }
}

/// Per-file bookkeeping used to skip unchanged files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// Absolute path.
    pub path: String,

    /// Modification time (Unix seconds).
    pub mtime: i64,

    /// File size in bytes.
    pub size: i64,

    /// blake3 digest of the raw file bytes.
    pub hash: String,

    /// Unix milliseconds when last indexed.
    pub last_indexed: i64,
}

impl FileState {
    /// Create a new file state record.
    #[must_use]
    pub fn new(path: impl Into<String>, mtime: i64, size: i64, hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mtime,
            size,
            hash: hash.into(),
            last_indexed: now_millis(),
        }
    }
}

/// Structured predicate for chunk lookups.
///
/// Terms are matched case-insensitively as substrings of the file path or
/// the serialized metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkFilter {
    /// Keyword terms. Empty means no keyword constraint.
    pub terms: Vec<String>,

    /// How terms combine.
    pub mode: KeywordMode,

    /// Only chunks with this filetype.
    pub filetype: Option<String>,

    /// Only chunks whose path starts with this prefix.
    pub path_prefix: Option<String>,
}

impl ChunkFilter {
    /// Filter on keyword terms.
    #[must_use]
    pub fn keywords(terms: Vec<String>, mode: KeywordMode) -> Self {
        Self {
            terms,
            mode,
            ..Self::default()
        }
    }

    /// Restrict to a filetype.
    #[must_use]
    pub fn with_filetype(mut self, filetype: impl Into<String>) -> Self {
        self.filetype = Some(filetype.into());
        self
    }

    /// Restrict to a directory or path prefix.
    #[must_use]
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }
}

/// A diff to apply for one file in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct ChunkChanges {
    /// File the changes belong to.
    pub file_path: String,

    /// Rows to insert or replace.
    pub upserts: Vec<ChunkRecord>,

    /// Chunk indices to delete.
    pub deletes: Vec<i32>,

    /// New file state, written with the chunks.
    pub file_state: Option<FileState>,
}

impl ChunkChanges {
    /// True when the diff writes nothing but file state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Aggregate index counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCounts {
    /// Distinct indexed file paths.
    pub files: u64,

    /// Stored chunks.
    pub chunks: u64,

    /// Chunks without an embedding.
    pub pending_chunks: u64,

    /// Most recent `updated_at` across all chunks.
    pub last_updated: Option<i64>,
}

/// Search result with similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult<T> {
    /// The matching record.
    pub record: T,

    /// Raw cosine distance from the query embedding (0 = identical, 2 = opposite).
    pub distance: f32,

    /// Normalized similarity score (0.0 = opposite, 1.0 = identical).
    pub score: f32,
}

impl<T> SearchResult<T> {
    /// Create a new search result.
    ///
    /// Converts distance to score using: `score = 1.0 - (distance / 2.0)`
    /// This maps the distance range [0, 2] to score range [1, 0].
    #[must_use]
    pub fn new(record: T, distance: f32) -> Self {
        let score = (1.0 - (distance / 2.0)).clamp(0.0, 1.0);
        Self {
            record,
            distance,
            score,
        }
    }
}
