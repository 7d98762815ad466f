//! Configuration management for dirindex.
//!
//! The binary fills [`Config`] from command-line arguments with
//! environment-variable fallbacks; library users build it directly.

mod settings;

pub use settings::{
    Config, KeywordMode, RetryPolicy, UnknownFiletypePolicy, DEFAULT_EXCLUDE_PATTERNS,
};
