//! dirindex library
//!
//! Keeps a semantic index of a directory tree in step with the files on
//! disk. Changes are watched, debounced and batched, files are chunked by
//! type, only changed chunks are embedded, and the result is queryable by
//! meaning, keyword or path.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod embeddings;
pub mod error;
pub mod indexer;
pub mod query;
pub mod server;
pub mod storage;
pub mod watcher;

pub use config::Config;
pub use error::{Error, Result};
