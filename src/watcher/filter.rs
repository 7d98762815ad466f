//! Path filtering: watch roots plus exclusion globs.
//!
//! The filter is a pure predicate. It never touches the filesystem while
//! deciding, so the same path always gets the same answer for a given
//! configuration.

use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::FilterError;

/// Decides which paths are tracked.
#[derive(Debug, Clone)]
pub struct PathFilter {
    roots: Vec<PathBuf>,
    patterns: Vec<String>,
    globs: GlobSet,
    /// Maps each compiled glob back to the pattern it came from.
    owners: Vec<usize>,
    gitignores: Vec<(PathBuf, Gitignore)>,
}

impl PathFilter {
    /// Build a filter.
    ///
    /// # Errors
    ///
    /// Returns an error if a root is relative or a pattern is malformed.
    pub fn new(
        roots: &[PathBuf],
        patterns: &[String],
    ) -> std::result::Result<Self, FilterError> {
        let roots = roots
            .iter()
            .map(|root| {
                if root.is_absolute() {
                    Ok(normalize(root))
                } else {
                    Err(FilterError::RelativeRoot(root.display().to_string()))
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut builder = GlobSetBuilder::new();
        let mut owners = Vec::new();

        for (index, pattern) in patterns.iter().enumerate() {
            for glob in expand_pattern(pattern) {
                let compiled = GlobBuilder::new(&glob)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| FilterError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.kind().to_string(),
                    })?;
                builder.add(compiled);
                owners.push(index);
            }
        }

        let globs = builder.build().map_err(|e| FilterError::InvalidPattern {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self {
            roots,
            patterns: patterns.to_vec(),
            globs,
            owners,
            gitignores: Vec::new(),
        })
    }

    /// Also exclude paths ignored by a `.gitignore` at each root.
    ///
    /// Roots without a readable `.gitignore` are skipped.
    #[must_use]
    pub fn with_gitignore(mut self) -> Self {
        for root in &self.roots {
            let gitignore_path = root.join(".gitignore");
            if !gitignore_path.is_file() {
                continue;
            }

            let mut builder = GitignoreBuilder::new(root);
            if let Some(e) = builder.add(&gitignore_path) {
                tracing::warn!(path = %gitignore_path.display(), error = %e, "Ignoring unreadable .gitignore");
                continue;
            }
            match builder.build() {
                Ok(gitignore) => self.gitignores.push((root.clone(), gitignore)),
                Err(e) => {
                    tracing::warn!(path = %gitignore_path.display(), error = %e, "Invalid .gitignore");
                }
            }
        }
        self
    }

    /// True if `path` is under a root and not excluded.
    #[must_use]
    pub fn should_track(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.root_of(&path).is_some() && !self.is_excluded(&path)
    }

    /// The root containing `path`, if any.
    #[must_use]
    pub fn root_for(&self, path: &Path) -> Option<&Path> {
        self.root_of(&normalize(path))
    }

    /// First configured pattern that excludes `path`.
    #[must_use]
    pub fn first_exclusion(&self, path: &Path) -> Option<&str> {
        let path = normalize(path);
        self.globs
            .matches(&path)
            .into_iter()
            .map(|i| self.owners[i])
            .min()
            .map(|i| self.patterns[i].as_str())
    }

    /// Configured roots, normalized.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn root_of(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .find(|root| path.starts_with(root))
            .map(PathBuf::as_path)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if self.globs.is_match(path) {
            return true;
        }

        self.gitignores.iter().any(|(root, gitignore)| {
            path.starts_with(root)
                && path != root.as_path()
                && gitignore.matched_path_or_any_parents(path, false).is_ignore()
        })
    }
}

/// Translate one exclusion pattern into the globs that implement it.
///
/// - trailing `/*`, `/**` or `/`: everything under that directory
/// - absolute patterns are anchored at `/`
/// - relative patterns match at any depth, and also exclude the contents
///   of a directory they name
fn expand_pattern(pattern: &str) -> Vec<String> {
    let pattern = pattern.trim();

    let dir_only = ["/**", "/*", "/"]
        .iter()
        .find_map(|suffix| pattern.strip_suffix(suffix));

    let anchored = pattern.starts_with('/');
    let base = dir_only.unwrap_or(pattern);
    let rooted = if anchored {
        base.to_string()
    } else {
        format!("**/{base}")
    };

    if dir_only.is_some() {
        vec![format!("{rooted}/**")]
    } else {
        vec![rooted.clone(), format!("{rooted}/**")]
    }
}

/// Resolve `.` and `..` without consulting the filesystem.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
