//! File system watcher using notify-rs.
//!
//! Each root is walked once and every tracked directory gets its own
//! non-recursive watch, so excluded trees such as `node_modules` never cost
//! a watch descriptor. Raw backend events are normalized into
//! [`ChangeEvent`]s and filtered before they reach the debouncer. Watches
//! are only ever added off the task that drains the backend queue.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::events::ChangeEvent;
use super::filter::PathFilter;
use crate::error::WatcherError;
use crate::server::metrics;
use crate::Result;

/// First retry delay after a failed registration.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Longest delay between registration retries.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Overall watcher health, published on a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchHealth {
    /// Every root is watched.
    Healthy,
    /// At least one root is backing off; changes under it are missed until
    /// it recovers.
    Degraded {
        /// Roots currently backing off.
        roots: Vec<PathBuf>,
    },
}

impl WatchHealth {
    /// True when no root is backing off.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Registration state of one root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootState {
    /// Not registered yet, or shut down.
    Unwatched,
    /// Watches are in place.
    Watching,
    /// Registration failed; retry at `retry_at`.
    Backoff {
        /// Failed attempts so far.
        attempt: u32,
        /// When the next attempt is due.
        retry_at: Instant,
    },
}

/// Delay before retry number `attempt` (1-based).
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

/// Watch bookkeeping shared by the drain and registrar tasks.
///
/// Only the registrar and shutdown touch `backend`. The drain task only
/// forgets directories, so it never waits on the backend's event thread.
struct Watches {
    backend: Mutex<Option<RecommendedWatcher>>,
    dirs: Mutex<HashSet<PathBuf>>,
    roots: Mutex<Vec<(PathBuf, RootState)>>,
}

impl Watches {
    fn new(backend: RecommendedWatcher, roots: Vec<(PathBuf, RootState)>) -> Self {
        Self {
            backend: Mutex::new(Some(backend)),
            dirs: Mutex::new(HashSet::new()),
            roots: Mutex::new(roots),
        }
    }

    /// Watch `dir` and every tracked directory below it. Returns the tracked
    /// files found along the way. Blocks on the walk and on the backend.
    fn register_tree(
        &self,
        filter: &PathFilter,
        dir: &Path,
    ) -> std::result::Result<Vec<PathBuf>, WatcherError> {
        if !dir.is_dir() {
            return Err(WatcherError::WatchFailed {
                path: dir.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || filter.should_track(entry.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(WatcherError::WatchFailed {
                        path: dir.display().to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let path = entry.path();
            if entry.file_type().is_dir() {
                if self.dirs.lock().contains(path) {
                    continue;
                }
                self.watch_dir(path)?;
                self.dirs.lock().insert(path.to_path_buf());
            } else if entry.file_type().is_file() {
                files.push(path.to_path_buf());
            }
        }

        Ok(files)
    }

    fn watch_dir(&self, dir: &Path) -> std::result::Result<(), WatcherError> {
        let failed = |reason: String| WatcherError::WatchFailed {
            path: dir.display().to_string(),
            reason,
        };
        let mut backend = self.backend.lock();
        let backend = backend
            .as_mut()
            .ok_or_else(|| failed("watcher stopped".to_string()))?;
        backend
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| failed(e.to_string()))
    }

    /// Forget watches at or below `path`. The backend drops them on its own
    /// when the directory goes away.
    fn forget(&self, path: &Path) {
        self.dirs.lock().retain(|dir| !dir.starts_with(path));
    }

    fn health(&self) -> WatchHealth {
        let backing_off: Vec<PathBuf> = self
            .roots
            .lock()
            .iter()
            .filter(|(_, state)| matches!(state, RootState::Backoff { .. }))
            .map(|(root, _)| root.clone())
            .collect();

        if backing_off.is_empty() {
            WatchHealth::Healthy
        } else {
            WatchHealth::Degraded { roots: backing_off }
        }
    }

    fn next_retry(&self) -> Option<Instant> {
        self.roots
            .lock()
            .iter()
            .filter_map(|(_, state)| match state {
                RootState::Backoff { retry_at, .. } => Some(*retry_at),
                _ => None,
            })
            .min()
    }

    /// Remove every watch and drop the backend.
    fn release(&self) {
        let backend = self.backend.lock().take();
        let dirs: Vec<PathBuf> = self.dirs.lock().drain().collect();
        if let Some(mut backend) = backend {
            for dir in dirs {
                if let Err(e) = backend.unwatch(&dir) {
                    tracing::debug!(path = %dir.display(), error = %e, "Unwatch failed");
                }
            }
        }
        for (_, state) in self.roots.lock().iter_mut() {
            *state = RootState::Unwatched;
        }
    }
}

/// Watches the configured roots and emits normalized change events.
///
/// Two tasks share the work. The drain task empties the backend's queue and
/// normalizes events. The registrar walks new directories and adds watches
/// on the blocking pool, since adding a watch waits on the backend's event
/// thread, which in turn waits for room in the queue.
pub struct ChangeWatcher {
    watches: Arc<Watches>,
    health_rx: watch::Receiver<WatchHealth>,
    registered_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    drain: Option<JoinHandle<()>>,
    registrar: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Start watching every root and forwarding events to `out`.
    ///
    /// Registration runs in the background; [`ChangeWatcher::registered`]
    /// flips once the first pass is done. Roots that are not directories
    /// start in backoff, so health is [`WatchHealth::Degraded`] right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the notify backend cannot be created.
    pub fn start(
        filter: Arc<PathFilter>,
        out: mpsc::Sender<ChangeEvent>,
        queue_capacity: usize,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel(queue_capacity.max(1));

        // Runs on the backend's thread; a full queue blocks it.
        let backend = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.blocking_send(res);
        })
        .map_err(|e| WatcherError::WatchFailed {
            path: "backend".to_string(),
            reason: e.to_string(),
        })?;

        let now = Instant::now();
        let roots = filter
            .roots()
            .iter()
            .map(|root| {
                let state = if root.is_dir() {
                    RootState::Unwatched
                } else {
                    tracing::warn!(path = %root.display(), "Root is not a directory, backing off");
                    RootState::Backoff {
                        attempt: 1,
                        retry_at: now + backoff_delay(1),
                    }
                };
                (root.clone(), state)
            })
            .collect();
        let watches = Arc::new(Watches::new(backend, roots));

        let health = watches.health();
        metrics::WATCH_DEGRADED.set(i64::from(!health.is_healthy()));
        let (health_tx, health_rx) = watch::channel(health);
        let (registered_tx, registered_rx) = watch::channel(false);
        let (appeared_tx, appeared_rx) = mpsc::unbounded_channel();

        let cancel = CancellationToken::new();
        let drain = tokio::spawn(drain_events(
            Arc::clone(&watches),
            Arc::clone(&filter),
            raw_rx,
            out.clone(),
            appeared_tx,
            cancel.clone(),
        ));
        let registrar = tokio::spawn(run_registrar(
            Registrar {
                watches: Arc::clone(&watches),
                filter,
                out,
                health_tx,
                cancel: cancel.clone(),
            },
            appeared_rx,
            registered_tx,
        ));

        Ok(Self {
            watches,
            health_rx,
            registered_rx,
            cancel,
            drain: Some(drain),
            registrar: Some(registrar),
        })
    }

    /// Subscribe to health changes.
    #[must_use]
    pub fn health(&self) -> watch::Receiver<WatchHealth> {
        self.health_rx.clone()
    }

    /// Becomes `true` once every root has had its first registration
    /// attempt.
    #[must_use]
    pub fn registered(&self) -> watch::Receiver<bool> {
        self.registered_rx.clone()
    }

    /// Current state of every root.
    #[must_use]
    pub fn root_states(&self) -> Vec<(PathBuf, RootState)> {
        self.watches.roots.lock().clone()
    }

    /// Number of directories with an active watch.
    #[must_use]
    pub fn watched_dir_count(&self) -> usize {
        self.watches.dirs.lock().len()
    }

    /// Stop both tasks, deregister every watch and close the output channel.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in [self.drain.take(), self.registrar.take()].into_iter().flatten() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Watcher task ended abnormally");
            }
        }

        let watches = Arc::clone(&self.watches);
        if let Err(e) = tokio::task::spawn_blocking(move || watches.release()).await {
            tracing::warn!(error = %e, "Failed to release watches");
        }
        tracing::info!("Change watcher stopped");
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Empty the backend queue. New directories go to the registrar; this task
/// never adds a watch itself.
async fn drain_events(
    watches: Arc<Watches>,
    filter: Arc<PathFilter>,
    mut raw_rx: mpsc::Receiver<notify::Result<Event>>,
    out: mpsc::Sender<ChangeEvent>,
    appeared: mpsc::UnboundedSender<PathBuf>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            () = cancel.cancelled() => break,
            raw = raw_rx.recv() => raw,
        };
        let event = match raw {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Watch error");
                continue;
            }
            None => break,
        };

        let normalized = normalize(&watches, &filter, event);
        for dir in normalized.dirs {
            if appeared.send(dir).is_err() {
                return;
            }
        }
        if !forward(&out, normalized.events, &cancel).await {
            break;
        }
    }
    tracing::debug!("Watch drain stopped");
}

/// Handles the registrar task needs.
struct Registrar {
    watches: Arc<Watches>,
    filter: Arc<PathFilter>,
    out: mpsc::Sender<ChangeEvent>,
    health_tx: watch::Sender<WatchHealth>,
    cancel: CancellationToken,
}

impl Registrar {
    /// Run `f` against the watch set on the blocking pool.
    async fn off_thread<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&Watches, &PathFilter) -> T + Send + 'static,
    {
        let watches = Arc::clone(&self.watches);
        let filter = Arc::clone(&self.filter);
        match tokio::task::spawn_blocking(move || f(&watches, &filter)).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = %e, "Watch registration task failed");
                None
            }
        }
    }

    /// Register due roots and publish the resulting health.
    async fn roots_pass(&self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let Some((events, health)) = self.off_thread(move |w, f| register_roots(w, f, now)).await else {
            return Vec::new();
        };
        metrics::WATCH_DEGRADED.set(i64::from(!health.is_healthy()));
        self.health_tx.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
        events
    }
}

async fn run_registrar(
    registrar: Registrar,
    mut appeared: mpsc::UnboundedReceiver<PathBuf>,
    registered: watch::Sender<bool>,
) {
    let mut events = registrar.roots_pass().await;
    registered.send_replace(true);

    loop {
        if !forward(&registrar.out, events, &registrar.cancel).await {
            break;
        }

        let next_retry = registrar.watches.next_retry();
        let retry_target = next_retry.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        events = tokio::select! {
            () = registrar.cancel.cancelled() => break,
            dir = appeared.recv() => {
                let Some(dir) = dir else { break };
                let mut dirs = vec![dir];
                while let Ok(dir) = appeared.try_recv() {
                    dirs.push(dir);
                }
                registrar
                    .off_thread(move |w, f| register_appeared(w, f, dirs))
                    .await
                    .unwrap_or_default()
            }
            () = tokio::time::sleep_until(retry_target), if next_retry.is_some() => {
                registrar.roots_pass().await
            }
        };
    }
    tracing::debug!("Watch registrar stopped");
}

/// Send `events` to `out`. False once the receiver is gone or `cancel` fires.
async fn forward(
    out: &mpsc::Sender<ChangeEvent>,
    events: Vec<ChangeEvent>,
    cancel: &CancellationToken,
) -> bool {
    for event in events {
        metrics::CHANGE_EVENTS
            .with_label_values(&[event.kind.label()])
            .inc();
        let sent = tokio::select! {
            () = cancel.cancelled() => return false,
            sent = out.send(event) => sent,
        };
        if sent.is_err() {
            tracing::warn!("Event receiver closed, stopping watcher");
            return false;
        }
    }
    true
}

/// Register every root that was never attempted or whose backoff has
/// expired. Recovered roots yield a `Created` event per tracked file so
/// changes made while unwatched are seen.
fn register_roots(watches: &Watches, filter: &PathFilter, now: Instant) -> (Vec<ChangeEvent>, WatchHealth) {
    let due: Vec<(usize, PathBuf, RootState)> = watches
        .roots
        .lock()
        .iter()
        .enumerate()
        .filter(|(_, (_, state))| match state {
            RootState::Unwatched => true,
            RootState::Backoff { retry_at, .. } => *retry_at <= now,
            RootState::Watching => false,
        })
        .map(|(i, (root, state))| (i, root.clone(), *state))
        .collect();

    let mut events = Vec::new();
    for (i, root, state) in due {
        let next = match (watches.register_tree(filter, &root), state) {
            (Ok(files), RootState::Backoff { attempt, .. }) => {
                tracing::info!(path = %root.display(), attempt, "Root recovered");
                events.extend(files.into_iter().map(ChangeEvent::created));
                RootState::Watching
            }
            (Ok(_), _) => {
                tracing::info!(path = %root.display(), "Watching directory");
                RootState::Watching
            }
            (Err(e), state) => {
                let attempt = match state {
                    RootState::Backoff { attempt, .. } => attempt.saturating_add(1),
                    _ => 1,
                };
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    path = %root.display(),
                    attempt,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Root unavailable, backing off"
                );
                RootState::Backoff {
                    attempt,
                    retry_at: now + delay,
                }
            }
        };
        if let Some(slot) = watches.roots.lock().get_mut(i) {
            slot.1 = next;
        }
    }

    (events, watches.health())
}

/// Watch directories that appeared and report the files already inside.
fn register_appeared(watches: &Watches, filter: &PathFilter, dirs: Vec<PathBuf>) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for dir in dirs {
        match watches.register_tree(filter, &dir) {
            Ok(files) => {
                tracing::debug!(path = %dir.display(), files = files.len(), "Watching new directory");
                events.extend(files.into_iter().map(ChangeEvent::created));
            }
            Err(e) if dir.exists() => {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to watch new directory");
            }
            Err(e) => {
                tracing::debug!(path = %dir.display(), error = %e, "Directory vanished before watching");
            }
        }
    }
    events
}

/// Output of normalizing one backend event.
#[derive(Debug, Default)]
struct Normalized {
    events: Vec<ChangeEvent>,
    /// Tracked directories that still need watches.
    dirs: Vec<PathBuf>,
}

/// Turn one backend event into tracked change events and directories to
/// watch.
fn normalize(watches: &Watches, filter: &PathFilter, event: Event) -> Normalized {
    let mut out = Normalized::default();

    if event.need_rescan() {
        tracing::warn!("Watch backend dropped events, rescanning roots");
        out.dirs.extend(filter.roots().iter().cloned());
    }

    match event.kind {
        EventKind::Access(_) => {}
        EventKind::Create(kind) => {
            for path in event.paths {
                if kind == CreateKind::Folder || path.is_dir() {
                    appeared_dir(filter, path, &mut out);
                } else {
                    push_tracked(filter, ChangeEvent::created(path), &mut out.events);
                }
            }
        }
        EventKind::Remove(kind) => {
            for path in event.paths {
                if kind == RemoveKind::Folder {
                    watches.forget(&path);
                }
                push_tracked(filter, ChangeEvent::deleted(path), &mut out.events);
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => renamed(watches, filter, mode, event.paths, &mut out),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            for path in event.paths {
                if path.is_dir() {
                    continue;
                }
                let change = if path.exists() {
                    ChangeEvent::modified(path)
                } else {
                    ChangeEvent::deleted(path)
                };
                push_tracked(filter, change, &mut out.events);
            }
        }
    }

    out
}

fn renamed(
    watches: &Watches,
    filter: &PathFilter,
    mode: RenameMode,
    paths: Vec<PathBuf>,
    out: &mut Normalized,
) {
    if mode == RenameMode::Both && paths.len() == 2 {
        let (from, to) = (&paths[0], &paths[1]);
        if to.is_dir() {
            watches.forget(from);
            push_tracked(filter, ChangeEvent::deleted(from.clone()), &mut out.events);
            appeared_dir(filter, to.clone(), out);
            return;
        }

        let change = match (filter.should_track(from), filter.should_track(to)) {
            (true, true) => Some(ChangeEvent::renamed(from.clone(), to.clone())),
            (false, true) => Some(ChangeEvent::created(to.clone())),
            (true, false) => Some(ChangeEvent::deleted(from.clone())),
            (false, false) => None,
        };
        out.events.extend(change);
        return;
    }

    for path in paths {
        if mode == RenameMode::From || !path.exists() {
            watches.forget(&path);
            push_tracked(filter, ChangeEvent::deleted(path), &mut out.events);
        } else if path.is_dir() {
            appeared_dir(filter, path, out);
        } else {
            push_tracked(filter, ChangeEvent::created(path), &mut out.events);
        }
    }
}

fn appeared_dir(filter: &PathFilter, dir: PathBuf, out: &mut Normalized) {
    if filter.should_track(&dir) {
        out.dirs.push(dir);
    }
}

fn push_tracked(filter: &PathFilter, event: ChangeEvent, out: &mut Vec<ChangeEvent>) {
    if filter.should_track(&event.path) {
        out.push(event);
    } else {
        tracing::trace!(path = %event.path.display(), "Ignoring untracked path");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::ChangeKind;
    use std::fs;
    use tempfile::TempDir;

    fn filter_for(root: &Path) -> Arc<PathFilter> {
        let patterns = vec!["*.tmp".to_string(), "node_modules/*".to_string()];
        Arc::new(PathFilter::new(&[root.to_path_buf()], &patterns).unwrap())
    }

    fn test_watches() -> Watches {
        let backend = notify::recommended_watcher(|_: notify::Result<Event>| {}).unwrap();
        Watches::new(backend, Vec::new())
    }

    async fn wait_registered(watcher: &ChangeWatcher) {
        let mut registered = watcher.registered();
        tokio::time::timeout(Duration::from_secs(10), registered.wait_for(|done| *done))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_register_tree_skips_excluded_dirs() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src/nested")).unwrap();
        fs::create_dir_all(tmp.path().join("node_modules/pkg")).unwrap();
        fs::write(tmp.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(tmp.path().join("scratch.tmp"), "x").unwrap();
        fs::write(tmp.path().join("node_modules/pkg/index.js"), "x").unwrap();

        let filter = filter_for(tmp.path());
        let watches = test_watches();
        let files = watches.register_tree(&filter, tmp.path()).unwrap();

        assert_eq!(files, vec![tmp.path().join("src/main.rs")]);
        let dirs = watches.dirs.lock();
        assert_eq!(dirs.len(), 3);
        assert!(!dirs.contains(&tmp.path().join("node_modules")));
    }

    #[test]
    fn test_register_missing_root_fails() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("gone");
        let watches = test_watches();
        let err = watches.register_tree(&filter_for(tmp.path()), &missing).unwrap_err();
        assert!(matches!(err, WatcherError::WatchFailed { .. }));
    }

    #[test]
    fn test_register_after_release_fails() {
        let tmp = TempDir::new().unwrap();
        let watches = test_watches();
        watches.release();
        assert!(watches.register_tree(&filter_for(tmp.path()), tmp.path()).is_err());
    }

    #[test]
    fn test_normalize_paired_rename() {
        let tmp = TempDir::new().unwrap();
        let filter = filter_for(tmp.path());
        let watches = test_watches();
        let from = tmp.path().join("a.txt");
        let to = tmp.path().join("b.txt");
        fs::write(&to, "x").unwrap();

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(from.clone())
            .add_path(to.clone());
        let out = normalize(&watches, &filter, event).events;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, to);
        assert_eq!(out[0].rename_source(), Some(from.as_path()));
    }

    #[test]
    fn test_normalize_rename_across_filter_boundary() {
        let tmp = TempDir::new().unwrap();
        let filter = filter_for(tmp.path());
        let watches = test_watches();
        let tracked = tmp.path().join("doc.md");
        let excluded = tmp.path().join("doc.tmp");

        let into_tracked = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(excluded.clone())
            .add_path(tracked.clone());
        let out = normalize(&watches, &filter, into_tracked).events;
        assert_eq!(out[0].kind, ChangeKind::Created);
        assert_eq!(out[0].path, tracked);

        let out_of_tracked = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(tracked.clone())
            .add_path(excluded);
        let out = normalize(&watches, &filter, out_of_tracked).events;
        assert_eq!(out[0].kind, ChangeKind::Deleted);
        assert_eq!(out[0].path, tracked);
    }

    #[test]
    fn test_normalize_unpaired_halves() {
        let tmp = TempDir::new().unwrap();
        let filter = filter_for(tmp.path());
        let watches = test_watches();
        let path = tmp.path().join("moved.txt");

        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(path.clone());
        assert_eq!(normalize(&watches, &filter, from).events[0].kind, ChangeKind::Deleted);

        fs::write(&path, "x").unwrap();
        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(path);
        assert_eq!(normalize(&watches, &filter, to).events[0].kind, ChangeKind::Created);
    }

    #[test]
    fn test_normalize_drops_access_and_excluded() {
        let tmp = TempDir::new().unwrap();
        let filter = filter_for(tmp.path());
        let watches = test_watches();

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(tmp.path().join("a.txt"));
        assert!(normalize(&watches, &filter, access).events.is_empty());

        let excluded = Event::new(EventKind::Create(CreateKind::File))
            .add_path(tmp.path().join("x.tmp"));
        assert!(normalize(&watches, &filter, excluded).events.is_empty());

        let outside = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/elsewhere/a.txt"));
        assert!(normalize(&watches, &filter, outside).events.is_empty());
    }

    #[test]
    fn test_new_directory_is_handed_off_then_synthesizes_created_events() {
        let tmp = TempDir::new().unwrap();
        let filter = filter_for(tmp.path());
        let watches = test_watches();
        let dir = tmp.path().join("fresh");
        fs::create_dir_all(dir.join("inner")).unwrap();
        fs::write(dir.join("one.txt"), "1").unwrap();
        fs::write(dir.join("inner/two.txt"), "2").unwrap();

        let event = Event::new(EventKind::Create(CreateKind::Folder)).add_path(dir.clone());
        let normalized = normalize(&watches, &filter, event);
        assert!(normalized.events.is_empty());
        assert_eq!(normalized.dirs, vec![dir.clone()]);
        assert!(watches.dirs.lock().is_empty());

        let mut paths: Vec<_> = register_appeared(&watches, &filter, normalized.dirs)
            .into_iter()
            .inspect(|e| assert_eq!(e.kind, ChangeKind::Created))
            .map(|e| e.path)
            .collect();
        paths.sort();

        assert_eq!(paths, vec![dir.join("inner/two.txt"), dir.join("one.txt")]);
        assert!(watches.dirs.lock().contains(&dir.join("inner")));
    }

    #[test]
    fn test_rescan_flag_requests_roots() {
        let tmp = TempDir::new().unwrap();
        let filter = filter_for(tmp.path());
        let watches = test_watches();

        let event = Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan);
        let normalized = normalize(&watches, &filter, event);
        assert_eq!(normalized.dirs, filter.roots().to_vec());
    }

    #[tokio::test]
    async fn test_missing_root_starts_degraded_then_recovers() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("later");
        let filter = filter_for(&root);
        let (tx, _rx) = mpsc::channel(16);

        let watcher = ChangeWatcher::start(Arc::clone(&filter), tx, 16).unwrap();
        assert!(matches!(
            *watcher.health().borrow(),
            WatchHealth::Degraded { ref roots } if roots == &vec![root.clone()]
        ));
        wait_registered(&watcher).await;

        fs::create_dir(&root).unwrap();
        let (_, health) = register_roots(&watcher.watches, &filter, Instant::now() + BACKOFF_CAP);
        assert!(health.is_healthy());
        assert_eq!(watcher.root_states()[0].1, RootState::Watching);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let watcher = ChangeWatcher::start(filter_for(tmp.path()), tx, 16).unwrap();
        wait_registered(&watcher).await;
        assert!(watcher.health().borrow().is_healthy());
        assert_eq!(watcher.watched_dir_count(), 2);

        watcher.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    /// A burst of new directories with a one-slot queue must not wedge the
    /// backend: later events keep arriving and every directory ends up
    /// watched.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_directory_burst_with_full_queue() {
        const DIRS: usize = 200;
        const FILES: usize = 20;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let watcher = ChangeWatcher::start(filter_for(&root), tx, 1).unwrap();
        wait_registered(&watcher).await;

        let burst_root = root.clone();
        let burst = tokio::task::spawn_blocking(move || {
            for d in 0..DIRS {
                let dir = burst_root.join(format!("d{d}"));
                fs::create_dir(&dir).unwrap();
                for f in 0..FILES {
                    fs::write(dir.join(format!("f{f}.txt")), "x").unwrap();
                }
            }
            fs::write(burst_root.join("marker.txt"), "done").unwrap();
        });

        let marker = root.join("marker.txt");
        let seen = tokio::time::timeout(Duration::from_secs(60), async {
            while let Some(event) = rx.recv().await {
                if event.path == marker {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(seen, Ok(true)), "marker event never arrived");
        burst.await.unwrap();

        let sink = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        tokio::time::timeout(Duration::from_secs(60), async {
            while watcher.watched_dir_count() < DIRS + 1 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(30), watcher.shutdown())
            .await
            .unwrap();
        sink.await.unwrap();
    }
}
