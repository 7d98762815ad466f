//! Filetype detection and the filetype → chunking strategy registry.

use std::collections::HashMap;
use std::path::Path;

use super::chunker::Strategy;
use crate::config::UnknownFiletypePolicy;

/// Filetype recorded for files without an extension.
pub const UNKNOWN_FILETYPE: &str = "unknown";

const CODE: &[&str] = &[
    "rs", "py", "pyi", "js", "mjs", "cjs", "jsx", "ts", "tsx", "go", "java", "kt", "kts", "scala",
    "c", "h", "cc", "cpp", "cxx", "hpp", "cs", "rb", "php", "swift", "sh", "bash", "zsh", "fish",
    "lua", "nix", "pl", "pm", "r", "jl", "ex", "exs", "erl", "hs", "ml", "mli", "clj", "dart",
    "zig", "sql", "proto",
];

const PROSE: &[&str] = &["md", "markdown", "mdx", "txt", "rst", "adoc", "org", "tex"];

const WINDOW: &[&str] = &[
    "json", "jsonl", "yaml", "yml", "toml", "xml", "html", "htm", "css", "scss", "ini", "cfg",
    "conf", "csv", "tsv", "log", "env", "lock", "graphql", "svg",
];

const SKIP: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "gz", "tgz", "bz2", "xz",
    "7z", "tar", "jar", "so", "dylib", "dll", "exe", "o", "a", "class", "pyc", "wasm", "woff",
    "woff2", "ttf", "otf", "mp3", "mp4", "mov", "avi", "wav", "flac", "db", "sqlite", "bin",
];

/// Filetype of `path`: its extension lower-cased, or `"unknown"`.
#[must_use]
pub fn filetype_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| UNKNOWN_FILETYPE.to_string())
}

/// Maps filetypes to chunking strategies.
#[derive(Debug, Clone)]
pub struct FiletypeRegistry {
    strategies: HashMap<String, Strategy>,
    unknown: Strategy,
}

impl FiletypeRegistry {
    /// Registry with the built-in entries.
    #[must_use]
    pub fn new(unknown: UnknownFiletypePolicy) -> Self {
        let mut strategies = HashMap::new();
        for (names, strategy) in [
            (CODE, Strategy::Code),
            (PROSE, Strategy::Prose),
            (WINDOW, Strategy::Window),
            (SKIP, Strategy::Skip),
        ] {
            for name in names {
                strategies.insert((*name).to_string(), strategy);
            }
        }

        let unknown = match unknown {
            UnknownFiletypePolicy::Window => Strategy::Window,
            UnknownFiletypePolicy::Skip => Strategy::Skip,
        };

        Self {
            strategies,
            unknown,
        }
    }

    /// Add or replace an entry.
    pub fn register(&mut self, filetype: &str, strategy: Strategy) {
        self.strategies.insert(filetype.to_lowercase(), strategy);
    }

    /// Strategy for `filetype`, falling back to the unknown-filetype policy.
    #[must_use]
    pub fn strategy_for(&self, filetype: &str) -> Strategy {
        self.strategies
            .get(&filetype.to_lowercase())
            .copied()
            .unwrap_or(self.unknown)
    }
}

impl Default for FiletypeRegistry {
    fn default() -> Self {
        Self::new(UnknownFiletypePolicy::default())
    }
}
