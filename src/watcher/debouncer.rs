//! Per-path debouncing and bounded batching.
//!
//! Every event for a path pushes that path's deadline out by the debounce
//! window. Deadlines are plain arithmetic on [`Instant`]s; the task sleeps
//! only until the earliest one. Released events are collected into batches
//! capped by size and by how long the batch has been open.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::events::{ChangeEvent, ChangeKind, EventBatch};
use crate::config::Config;

/// Debounce and batch limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Quiet period per path.
    pub window: Duration,
    /// Maximum events per batch.
    pub max_batch: usize,
    /// Maximum time a batch stays open after its first event.
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(500),
            max_batch: 10,
            max_wait: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for DebounceConfig {
    fn from(config: &Config) -> Self {
        Self {
            window: config.debounce,
            max_batch: config.batch_size,
            max_wait: config.batch_timeout,
        }
    }
}

#[derive(Debug)]
struct Pending {
    event: ChangeEvent,
    deadline: Instant,
    seq: u64,
}

/// Debounce state. Drive it with [`Debouncer::run`].
#[derive(Debug)]
pub struct Debouncer {
    config: DebounceConfig,
    pending: HashMap<PathBuf, Pending>,
    seq: u64,
}

impl Debouncer {
    /// Create an empty debouncer.
    #[must_use]
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            seq: 0,
        }
    }

    /// Number of paths waiting for their deadline.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record an event observed at `now`.
    pub fn observe(&mut self, event: ChangeEvent, now: Instant) {
        let deadline = now + self.config.window;

        // A rename supersedes whatever was still pending for its source.
        if let ChangeKind::Renamed { from } = &event.kind {
            self.pending.remove(from);
        }

        let merged = match self.pending.remove(&event.path) {
            Some(previous) => {
                if let (ChangeKind::Renamed { from }, ChangeKind::Deleted) =
                    (&previous.event.kind, &event.kind)
                {
                    let source = ChangeEvent::deleted(from.clone());
                    self.insert(source, deadline);
                }
                previous.event.coalesce(event)
            }
            None => event,
        };

        self.insert(merged, deadline);
    }

    fn insert(&mut self, event: ChangeEvent, deadline: Instant) {
        self.seq += 1;
        let seq = self.seq;
        self.pending.insert(
            event.path.clone(),
            Pending {
                event,
                deadline,
                seq,
            },
        );
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every event whose deadline has passed, in
    /// deadline order.
    pub fn release_due(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut released: Vec<Pending> = due
            .into_iter()
            .filter_map(|path| self.pending.remove(&path))
            .collect();
        released.sort_by_key(|p| (p.deadline, p.seq));
        released.into_iter().map(|p| p.event).collect()
    }

    /// Remove and return everything, in deadline order.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        let mut released: Vec<Pending> = self.pending.drain().map(|(_, p)| p).collect();
        released.sort_by_key(|p| (p.deadline, p.seq));
        released.into_iter().map(|p| p.event).collect()
    }

    /// Consume events from `rx` and send batches to `tx` until `rx` closes.
    ///
    /// On close, pending events are released immediately and the final
    /// batch is flushed. Returns early if `tx` is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ChangeEvent>, tx: mpsc::Sender<EventBatch>) {
        let mut batch = EventBatch::new();
        let mut opened_at: Option<Instant> = None;

        loop {
            let batch_deadline = opened_at.map(|t| t + self.config.max_wait);
            let wake = match (self.next_deadline(), batch_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let sleep_target = wake.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                received = rx.recv() => {
                    if let Some(event) = received {
                        self.observe(event, Instant::now());
                    } else {
                        for event in self.drain() {
                            batch.push(event);
                            if batch.len() >= self.config.max_batch && !send(&tx, &mut batch).await {
                                return;
                            }
                        }
                        if !batch.is_empty() {
                            let _ = send(&tx, &mut batch).await;
                        }
                        tracing::debug!("Debouncer input closed, flushed pending events");
                        return;
                    }
                }
                () = tokio::time::sleep_until(sleep_target), if wake.is_some() => {}
            }

            let now = Instant::now();
            for event in self.release_due(now) {
                if batch.is_empty() {
                    opened_at = Some(now);
                }
                batch.push(event);
                if batch.len() >= self.config.max_batch {
                    opened_at = None;
                    if !send(&tx, &mut batch).await {
                        return;
                    }
                }
            }

            if opened_at.is_some_and(|t| t + self.config.max_wait <= now) {
                opened_at = None;
                if !send(&tx, &mut batch).await {
                    return;
                }
            }
        }
    }
}

/// Send the batch, leaving it empty. Returns false if the receiver is gone.
async fn send(tx: &mpsc::Sender<EventBatch>, batch: &mut EventBatch) -> bool {
    if batch.is_empty() {
        return true;
    }
    let outgoing = std::mem::take(batch);
    tracing::debug!(events = outgoing.len(), "Releasing event batch");
    if tx.send(outgoing).await.is_err() {
        tracing::warn!("Batch receiver closed, stopping debouncer");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const WINDOW: Duration = Duration::from_millis(500);

    fn debouncer() -> Debouncer {
        Debouncer::new(DebounceConfig {
            window: WINDOW,
            max_batch: 3,
            max_wait: Duration::from_secs(5),
        })
    }

    #[test]
    fn test_event_held_until_window_passes() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe(ChangeEvent::modified("/a"), t0);

        assert!(d.release_due(t0 + Duration::from_millis(499)).is_empty());
        let released = d.release_due(t0 + WINDOW);
        assert_eq!(released.len(), 1);
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn test_repeated_events_reset_deadline() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe(ChangeEvent::modified("/a"), t0);
        d.observe(ChangeEvent::modified("/a"), t0 + Duration::from_millis(400));

        assert!(d.release_due(t0 + WINDOW).is_empty());
        assert_eq!(d.next_deadline(), Some(t0 + Duration::from_millis(900)));
        assert_eq!(d.release_due(t0 + Duration::from_millis(900)).len(), 1);
    }

    #[test]
    fn test_paths_are_independent() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe(ChangeEvent::modified("/a"), t0);
        d.observe(ChangeEvent::modified("/b"), t0 + Duration::from_millis(300));

        let first = d.release_due(t0 + WINDOW);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].path, Path::new("/a"));
        assert_eq!(d.pending_len(), 1);
    }

    #[test]
    fn test_release_order_follows_deadlines() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe(ChangeEvent::modified("/late"), t0 + Duration::from_millis(20));
        d.observe(ChangeEvent::modified("/early"), t0);
        d.observe(ChangeEvent::modified("/middle"), t0 + Duration::from_millis(10));

        let order: Vec<_> = d
            .release_due(t0 + Duration::from_secs(1))
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            order,
            vec![PathBuf::from("/early"), PathBuf::from("/middle"), PathBuf::from("/late")]
        );
    }

    #[test]
    fn test_rename_discards_pending_source() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe(ChangeEvent::modified("/old"), t0);
        d.observe(ChangeEvent::renamed("/old", "/new"), t0);

        let released = d.drain();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].rename_source(), Some(Path::new("/old")));
    }

    #[test]
    fn test_rename_then_delete_deletes_both_paths() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe(ChangeEvent::renamed("/old", "/new"), t0);
        d.observe(ChangeEvent::deleted("/new"), t0);

        let mut released: Vec<_> = d.drain();
        released.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|e| e.kind == ChangeKind::Deleted));
        assert_eq!(released[0].path, Path::new("/new"));
        assert_eq!(released[1].path, Path::new("/old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batches_by_size() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let task = tokio::spawn(debouncer().run(event_rx, batch_tx));

        for name in ["/1", "/2", "/3", "/4"] {
            event_tx.send(ChangeEvent::modified(name)).await.unwrap();
        }

        let first = batch_rx.recv().await.unwrap();
        assert_eq!(first.len(), 3);

        // The fourth event waits for the batch timeout.
        let second = batch_rx.recv().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second.events()[0].path, Path::new("/4"));

        drop(event_tx);
        task.await.unwrap();
        assert!(batch_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_close() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let task = tokio::spawn(debouncer().run(event_rx, batch_tx));

        event_tx.send(ChangeEvent::created("/a")).await.unwrap();
        event_tx.send(ChangeEvent::modified("/a")).await.unwrap();
        drop(event_tx);

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.events()[0].kind, ChangeKind::Created);
        task.await.unwrap();
    }
}
