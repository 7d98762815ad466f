//! Query planning over the chunk index.
//!
//! Queries are plain data ([`Query`]) so they can arrive over HTTP, from the
//! tool surface or from library callers alike. The [`QueryPlanner`] maps
//! each one onto storage and embedding calls.

mod planner;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::KeywordMode;
use crate::storage::{ChunkRecord, IndexCounts, SearchResult};

pub use planner::QueryPlanner;

/// A query against the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    /// Nearest chunks to `text` by embedding.
    Semantic {
        text: String,
        limit: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filetype: Option<String>,
        /// Only chunks under this directory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        directory: Option<String>,
    },
    /// Substring match of terms against path and metadata.
    Keyword {
        terms: Vec<String>,
        limit: usize,
        /// Overrides the configured mode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<KeywordMode>,
    },
    /// The reassembled content of one file.
    ExactPath { path: String },
    /// Indexed paths, most recently inserted first.
    List { limit: usize },
    /// Index counters.
    Stats,
}

impl Query {
    /// Label used for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Semantic { .. } => "semantic",
            Self::Keyword { .. } => "keyword",
            Self::ExactPath { .. } => "exact_path",
            Self::List { .. } => "list",
            Self::Stats => "stats",
        }
    }
}

/// One matching chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub filepath: String,
    pub chunk_index: i32,
    pub start_line: i32,
    pub end_line: i32,
    pub filetype: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    /// Unix milliseconds.
    pub updated_at: i64,
    /// No embedding stored yet.
    pub pending: bool,
    /// Similarity in `[0, 1]`; semantic queries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    /// Raw cosine distance; semantic queries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

impl From<ChunkRecord> for SearchHit {
    fn from(record: ChunkRecord) -> Self {
        let pending = record.is_pending();
        Self {
            filepath: record.file_path,
            chunk_index: record.chunk_index,
            start_line: record.start_line,
            end_line: record.end_line,
            filetype: record.filetype,
            content: record.content,
            metadata: record.metadata,
            updated_at: record.updated_at,
            pending,
            score: None,
            distance: None,
        }
    }
}

impl From<SearchResult<ChunkRecord>> for SearchHit {
    fn from(result: SearchResult<ChunkRecord>) -> Self {
        Self {
            score: Some(result.score),
            distance: Some(result.distance),
            ..Self::from(result.record)
        }
    }
}

/// A whole file rebuilt from its chunks.
///
/// `content` has `\n` line endings and no trailing blank lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDocument {
    pub filepath: String,
    pub filetype: String,
    pub content: String,
    pub chunk_count: usize,
    pub pending_chunks: usize,
    /// File-level metadata (size, mtime, hash, name, directory).
    pub metadata: Map<String, Value>,
    /// Most recent chunk update, Unix milliseconds.
    pub updated_at: i64,
}

/// Index counters as reported to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub files: u64,
    pub chunks: u64,
    pub pending_chunks: u64,
    /// Unix milliseconds of the last chunk write.
    pub last_updated: Option<i64>,
}

impl From<IndexCounts> for IndexStats {
    fn from(counts: IndexCounts) -> Self {
        Self {
            files: counts.files,
            chunks: counts.chunks,
            pending_chunks: counts.pending_chunks,
            last_updated: counts.last_updated,
        }
    }
}

/// Result of [`QueryPlanner::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "snake_case")]
pub enum QueryResponse {
    Hits(Vec<SearchHit>),
    File(FileDocument),
    Files(Vec<String>),
    Stats(IndexStats),
}
