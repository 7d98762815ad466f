//! Normalized change events and batches.

#![allow(clippy::missing_const_for_fn)]

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// What happened to a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// File appeared.
    Created,
    /// File content changed.
    Modified,
    /// File disappeared.
    Deleted,
    /// File moved here from `from`.
    Renamed { from: PathBuf },
}

impl ChangeKind {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Renamed { .. } => "renamed",
        }
    }
}

/// One filesystem change, after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Affected path; the destination for renames.
    pub path: PathBuf,
    /// Kind of change.
    pub kind: ChangeKind,
    /// When the change was observed.
    pub timestamp: SystemTime,
}

impl ChangeEvent {
    /// Create an event stamped now.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: SystemTime::now(),
        }
    }

    /// Shorthand for a `Created` event.
    #[must_use]
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Created)
    }

    /// Shorthand for a `Modified` event.
    #[must_use]
    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    /// Shorthand for a `Deleted` event.
    #[must_use]
    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Deleted)
    }

    /// Shorthand for a `Renamed` event.
    #[must_use]
    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self::new(to, ChangeKind::Renamed { from: from.into() })
    }

    /// Source path of a rename.
    #[must_use]
    pub fn rename_source(&self) -> Option<&Path> {
        match &self.kind {
            ChangeKind::Renamed { from } => Some(from),
            _ => None,
        }
    }

    /// Paths whose index entries this event reads or writes.
    pub fn touched_paths(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.path.as_path()).chain(self.rename_source())
    }

    /// Merge a later event for the same path into this one.
    ///
    /// The result describes the net effect of both changes.
    #[must_use]
    pub fn coalesce(self, next: Self) -> Self {
        let kind = match (self.kind, next.kind) {
            (_, ChangeKind::Renamed { from }) => ChangeKind::Renamed { from },
            (ChangeKind::Created, ChangeKind::Modified | ChangeKind::Created) => ChangeKind::Created,
            (ChangeKind::Deleted, ChangeKind::Created | ChangeKind::Modified) => ChangeKind::Modified,
            (ChangeKind::Renamed { from }, ChangeKind::Modified | ChangeKind::Created) => {
                ChangeKind::Renamed { from }
            }
            (_, ChangeKind::Deleted) => ChangeKind::Deleted,
            (ChangeKind::Modified, kind) => kind,
        };

        Self {
            path: next.path,
            kind,
            timestamp: next.timestamp,
        }
    }
}

/// Debounced events released together, in release order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventBatch {
    events: Vec<ChangeEvent>,
}

impl EventBatch {
    /// Create a new empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event; an event for a path already in the batch is merged
    /// into the existing entry so each path appears once.
    pub fn push(&mut self, event: ChangeEvent) {
        if let Some(existing) = self.events.iter_mut().find(|e| e.path == event.path) {
            let merged = existing.clone().coalesce(event);
            *existing = merged;
        } else {
            self.events.push(event);
        }
    }

    /// Events in release order.
    #[must_use]
    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Check if batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Take the events, leaving the batch empty.
    pub fn take(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Split into groups that can each run concurrently, to be run in
    /// order.
    ///
    /// Two events whose touched paths are equal, or where one is an
    /// ancestor of the other, land in different groups, with the earlier
    /// event in the earlier group.
    #[must_use]
    pub fn into_waves(self) -> Vec<Vec<ChangeEvent>> {
        let mut waves: Vec<Vec<ChangeEvent>> = Vec::new();
        let mut placed: Vec<(PathBuf, usize)> = Vec::new();

        for event in self.events {
            let touched: Vec<PathBuf> = event.touched_paths().map(Path::to_path_buf).collect();
            let wave = placed
                .iter()
                .filter(|(path, _)| touched.iter().any(|t| overlaps(t, path)))
                .map(|(_, wave)| wave + 1)
                .max()
                .unwrap_or(0);

            placed.extend(touched.into_iter().map(|path| (path, wave)));
            if wave == waves.len() {
                waves.push(Vec::new());
            }
            waves[wave].push(event);
        }

        waves
    }
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

impl IntoIterator for EventBatch {
    type Item = ChangeEvent;
    type IntoIter = std::vec::IntoIter<ChangeEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_after(first: ChangeEvent, second: ChangeEvent) -> ChangeKind {
        first.coalesce(second).kind
    }

    #[test]
    fn test_coalesce_create_then_modify() {
        assert_eq!(
            kind_after(ChangeEvent::created("/a"), ChangeEvent::modified("/a")),
            ChangeKind::Created
        );
    }

    #[test]
    fn test_coalesce_anything_then_delete() {
        assert_eq!(
            kind_after(ChangeEvent::created("/a"), ChangeEvent::deleted("/a")),
            ChangeKind::Deleted
        );
        assert_eq!(
            kind_after(ChangeEvent::modified("/a"), ChangeEvent::deleted("/a")),
            ChangeKind::Deleted
        );
    }

    #[test]
    fn test_coalesce_delete_then_create_is_modify() {
        assert_eq!(
            kind_after(ChangeEvent::deleted("/a"), ChangeEvent::created("/a")),
            ChangeKind::Modified
        );
    }

    #[test]
    fn test_coalesce_keeps_rename_source() {
        let merged = ChangeEvent::renamed("/old", "/new").coalesce(ChangeEvent::modified("/new"));
        assert_eq!(merged.rename_source(), Some(Path::new("/old")));

        let merged = ChangeEvent::modified("/new").coalesce(ChangeEvent::renamed("/old", "/new"));
        assert_eq!(merged.rename_source(), Some(Path::new("/old")));
    }

    #[test]
    fn test_batch_dedups_paths_in_order() {
        let mut batch = EventBatch::new();
        batch.push(ChangeEvent::created("/a"));
        batch.push(ChangeEvent::modified("/b"));
        batch.push(ChangeEvent::deleted("/a"));

        let paths: Vec<_> = batch.events().iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(batch.events()[0].kind, ChangeKind::Deleted);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_batch_take() {
        let mut batch = EventBatch::new();
        batch.push(ChangeEvent::modified("/a"));
        assert_eq!(batch.take().len(), 1);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_labels() {
        assert_eq!(ChangeEvent::renamed("/x", "/y").kind.label(), "renamed");
        assert_eq!(ChangeKind::Deleted.label(), "deleted");
    }

    #[test]
    fn test_rename_source_orders_waves() {
        let mut batch = EventBatch::new();
        batch.push(ChangeEvent::renamed("/a", "/b"));
        batch.push(ChangeEvent::created("/a"));
        batch.push(ChangeEvent::modified("/c"));
        assert_eq!(batch.len(), 3);

        let waves = batch.into_waves();
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 2);
        assert_eq!(waves[0][0].rename_source(), Some(Path::new("/a")));
        assert_eq!(waves[0][1].path, PathBuf::from("/c"));
        assert_eq!(waves[1].len(), 1);
        assert_eq!(waves[1][0].kind, ChangeKind::Created);
    }

    #[test]
    fn test_directory_delete_orders_children() {
        let mut batch = EventBatch::new();
        batch.push(ChangeEvent::deleted("/dir"));
        batch.push(ChangeEvent::created("/dir/x.md"));
        batch.push(ChangeEvent::created("/dirt.md"));

        let waves = batch.into_waves();
        let paths: Vec<Vec<&str>> = waves
            .iter()
            .map(|wave| wave.iter().map(|e| e.path.to_str().unwrap()).collect())
            .collect();
        assert_eq!(paths, vec![vec!["/dir", "/dirt.md"], vec!["/dir/x.md"]]);
    }

    #[test]
    fn test_independent_events_share_a_wave() {
        let mut batch = EventBatch::new();
        for name in ["/a", "/b", "/c"] {
            batch.push(ChangeEvent::modified(name));
        }
        assert_eq!(batch.into_waves().len(), 1);
        assert!(EventBatch::new().into_waves().is_empty());
    }
}
