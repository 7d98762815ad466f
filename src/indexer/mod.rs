//! Chunking and incremental indexing.
//!
//! This module provides:
//! - Filetype detection and the chunking strategy registry
//! - Code, prose and sliding-window chunkers
//! - Reconciliation of a file's chunks against the stored set
//! - The running pipeline from change events to index writes

mod chunker;
mod filetype;
#[allow(clippy::module_inception)]
mod indexer;
mod pipeline;

pub use chunker::{assemble, is_binary, Chunk, Chunker, ChunkerConfig, Strategy};
pub use filetype::{filetype_of, FiletypeRegistry, UNKNOWN_FILETYPE};
pub use indexer::{FileInfo, IndexOutcome, Indexer, ReconcileReport};
pub use pipeline::{process_batch, BatchSummary, Pipeline, PipelineHandle};
