//! Lazy strategy: watcher events only mark files dirty in a persistent
//! queue; the work happens on an idle timer (reset by every event), at
//! shutdown, or when a search takes `flush` before reading.

use super::{FileEvent, FileEventKind, StrategyStats, WatcherMsg, spawn_watcher};
use crate::config::layout;
use crate::error::Result;
use crate::index_manager::IndexManager;
use crate::paths::to_relative;
use crate::sync::atomic_write_json;
use notify::RecursiveMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Watcher debounce; coarser than realtime since nothing is applied
/// until a flush anyway.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Quiet period after the last event before an automatic flush.
const IDLE_FLUSH: Duration = Duration::from_secs(30);

/// How long an external flush waits for debounced events still in the
/// watcher channel.
const CHANNEL_DRAIN_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct DirtyQueue {
    changed: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl DirtyQueue {
    fn len(&self) -> usize {
        self.changed.len() + self.removed.len()
    }

    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

struct Shared {
    manager: Arc<IndexManager>,
    queue: parking_lot::Mutex<DirtyQueue>,
    queue_path: PathBuf,
    active: AtomicBool,
    flush_in_progress: AtomicBool,
    /// Debounced watcher batches sent but not yet folded into the queue.
    channel_backlog: Arc<AtomicUsize>,
    processed: AtomicU64,
    last_event: parking_lot::Mutex<tokio::time::Instant>,
}

impl Shared {
    fn save_queue(&self) {
        let queue = self.queue.lock().clone();
        if let Err(e) = atomic_write_json(&self.queue_path, &queue, false) {
            warn!("failed to persist dirty queue: {e}");
        }
    }

    fn enqueue(&self, events: &[FileEvent]) {
        let root = self.manager.project_root();
        let mut queue = self.queue.lock();
        for event in events {
            let relative = to_relative(root, &event.path);
            if relative.is_empty() {
                continue;
            }
            match event.kind {
                FileEventKind::Removed => {
                    queue.changed.remove(&relative);
                    queue.removed.insert(relative);
                }
                FileEventKind::Created | FileEventKind::Modified => {
                    queue.removed.remove(&relative);
                    queue.changed.insert(relative);
                }
            }
        }
        drop(queue);
        self.save_queue();
        *self.last_event.lock() = tokio::time::Instant::now();
    }

    /// Applies the queue: deletions first, then changes, then clears and
    /// persists it. Guarded against overlapping flushes.
    async fn run_flush(&self) -> Result<()> {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Someone else is flushing; wait for them instead of
            // stacking a second pass.
            while self.flush_in_progress.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return Ok(());
        }
        struct FlushGuard<'a>(&'a AtomicBool);
        impl Drop for FlushGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        let _guard = FlushGuard(&self.flush_in_progress);

        let snapshot = self.queue.lock().clone();
        if snapshot.is_empty() {
            return Ok(());
        }
        debug!(
            changed = snapshot.changed.len(),
            removed = snapshot.removed.len(),
            "lazy flush"
        );

        for path in &snapshot.removed {
            if let Err(e) = self.manager.remove_file(path).await {
                warn!(path = %path, "lazy removal failed: {e}");
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
        for path in &snapshot.changed {
            match self.manager.update_file(path).await {
                Ok(_) => {
                    self.processed.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) if matches!(e.code(), "FILE_EXCLUDED" | "FILE_NOT_FOUND") => {
                    debug!(path = %path, "lazy update skipped: {}", e.code());
                }
                Err(e) => warn!(path = %path, "lazy update failed: {e}"),
            }
        }

        {
            let mut queue = self.queue.lock();
            for path in &snapshot.removed {
                queue.removed.remove(path);
            }
            for path in &snapshot.changed {
                queue.changed.remove(path);
            }
        }
        self.save_queue();
        self.manager.save_all().await?;
        Ok(())
    }
}

pub struct LazyStrategy {
    shared: Arc<Shared>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl LazyStrategy {
    pub fn new(manager: Arc<IndexManager>) -> Self {
        let queue_path = manager.index_dir().join(layout::DIRTY_FILES);
        Self {
            shared: Arc::new(Shared {
                manager,
                queue: parking_lot::Mutex::new(DirtyQueue::default()),
                queue_path,
                active: AtomicBool::new(false),
                flush_in_progress: AtomicBool::new(false),
                channel_backlog: Arc::new(AtomicUsize::new(0)),
                processed: AtomicU64::new(0),
                last_event: parking_lot::Mutex::new(tokio::time::Instant::now()),
            }),
            worker: None,
        }
    }

    /// Reloads the persisted dirty queue so work survives restarts.
    pub async fn initialize(&mut self) -> Result<()> {
        if let Ok(json) = std::fs::read_to_string(&self.shared.queue_path) {
            match serde_json::from_str::<DirtyQueue>(&json) {
                Ok(queue) => {
                    if !queue.is_empty() {
                        info!(pending = queue.len(), "restored dirty queue from disk");
                    }
                    *self.shared.queue.lock() = queue;
                }
                Err(e) => warn!("dirty queue unreadable, starting empty: {e}"),
            }
        }
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.shared.active.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        self.worker = Some(tokio::spawn(run_worker(shared)));
        info!("lazy strategy started (idle flush {}s)", IDLE_FLUSH.as_secs());
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        // Drain what the queue still holds so nothing is lost.
        if let Err(e) = self.shared.run_flush().await {
            warn!("final lazy flush failed: {e}");
        }
        info!("lazy strategy stopped");
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub async fn on_file_event(&self, event: FileEvent) {
        self.shared.enqueue(std::slice::from_ref(&event));
    }

    /// External synchronization point: waits out the watcher channel,
    /// then applies the whole queue.
    pub async fn flush(&self) -> Result<()> {
        let deadline = std::time::Instant::now() + CHANNEL_DRAIN_WAIT;
        while self.shared.channel_backlog.load(Ordering::SeqCst) > 0 {
            if std::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.shared.run_flush().await
    }

    pub fn stats(&self) -> StrategyStats {
        StrategyStats {
            kind: "lazy",
            active: self.is_active(),
            pending_events: self.shared.queue.lock().len(),
            processed_events: self.shared.processed.load(Ordering::SeqCst),
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    let root = shared.manager.project_root().to_path_buf();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = match spawn_watcher(
        &root,
        RecursiveMode::Recursive,
        DEBOUNCE,
        tx,
        Some(shared.channel_backlog.clone()),
    ) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("lazy watcher failed to start, queue fills via injection only: {e}");
            None
        }
    };

    loop {
        let deadline = {
            let last = *shared.last_event.lock();
            if shared.queue.lock().is_empty() {
                // Nothing queued; just park until an event arrives.
                None
            } else {
                Some(last + IDLE_FLUSH)
            }
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(WatcherMsg::Events(events)) => {
                            shared.enqueue(&events);
                            let _ = shared.channel_backlog.fetch_update(
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                                |b| Some(b.saturating_sub(1)),
                            );
                        }
                        Some(WatcherMsg::Failed(message)) => {
                            warn!("lazy watcher error: {message}");
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        if let Err(e) = shared.run_flush().await {
                            warn!("idle flush failed: {e}");
                        }
                    }
                }
            }
            None => match rx.recv().await {
                Some(WatcherMsg::Events(events)) => {
                    shared.enqueue(&events);
                    let _ = shared.channel_backlog.fetch_update(
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        |b| Some(b.saturating_sub(1)),
                    );
                }
                Some(WatcherMsg::Failed(message)) => {
                    warn!("lazy watcher error: {message}");
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FtsEngineKind};
    use crate::embedder::HashEmbedder;
    use tokio::sync::broadcast;

    async fn manager(project: &std::path::Path, index: &std::path::Path) -> Arc<IndexManager> {
        let mut config = Config::default();
        config.hybrid_search.fts_engine = FtsEngineKind::Portable;
        let (tx, _) = broadcast::channel(64);
        IndexManager::open(
            dunce::canonicalize(project).unwrap(),
            index.to_path_buf(),
            config,
            Arc::new(HashEmbedder),
            tx,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn events_queue_until_flush() {
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        let manager = manager(project.path(), index.path()).await;

        let mut strategy = LazyStrategy::new(manager.clone());
        strategy.initialize().await.unwrap();
        strategy.start().await.unwrap();

        let file = manager.project_root().join("src/lazy.rs");
        std::fs::write(&file, "fn lazily_indexed() {}\n").unwrap();
        strategy
            .on_file_event(FileEvent { path: file, kind: FileEventKind::Created })
            .await;

        // Queued, not yet applied.
        assert_eq!(strategy.stats().pending_events, 1);
        assert!(manager.code_store().vectors.indexed_files().await.is_empty());

        strategy.flush().await.unwrap();
        assert_eq!(strategy.stats().pending_events, 0);
        assert_eq!(
            manager.code_store().vectors.indexed_files().await,
            vec!["src/lazy.rs".to_string()]
        );
        strategy.stop().await;
    }

    #[tokio::test]
    async fn deletions_apply_before_changes() {
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        let manager = manager(project.path(), index.path()).await;

        let kept = manager.project_root().join("src/kept.rs");
        let gone = manager.project_root().join("src/gone.rs");
        std::fs::write(&kept, "fn kept() {}\n").unwrap();
        std::fs::write(&gone, "fn gone() {}\n").unwrap();

        let mut strategy = LazyStrategy::new(manager.clone());
        strategy.start().await.unwrap();
        strategy
            .on_file_event(FileEvent { path: gone.clone(), kind: FileEventKind::Created })
            .await;
        strategy.flush().await.unwrap();

        std::fs::remove_file(&gone).unwrap();
        strategy.on_file_event(FileEvent { path: kept, kind: FileEventKind::Created }).await;
        strategy.on_file_event(FileEvent { path: gone, kind: FileEventKind::Removed }).await;
        strategy.flush().await.unwrap();

        let files = manager.code_store().vectors.indexed_files().await;
        assert_eq!(files, vec!["src/kept.rs".to_string()]);
        strategy.stop().await;
    }

    #[tokio::test]
    async fn queue_persists_across_restart() {
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        let manager = manager(project.path(), index.path()).await;

        let file = manager.project_root().join("src/queued.rs");
        std::fs::write(&file, "fn queued() {}\n").unwrap();

        {
            let strategy = LazyStrategy::new(manager.clone());
            strategy
                .on_file_event(FileEvent { path: file, kind: FileEventKind::Created })
                .await;
            // Dropped without flushing; the queue file remains.
        }

        let mut strategy = LazyStrategy::new(manager.clone());
        strategy.initialize().await.unwrap();
        assert_eq!(strategy.stats().pending_events, 1);
        strategy.flush().await.unwrap();
        assert_eq!(
            manager.code_store().vectors.indexed_files().await,
            vec!["src/queued.rs".to_string()]
        );
    }

    #[tokio::test]
    async fn duplicate_events_collapse() {
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        let manager = manager(project.path(), index.path()).await;
        let file = manager.project_root().join("src/dup.rs");
        std::fs::write(&file, "fn dup() {}\n").unwrap();

        let strategy = LazyStrategy::new(manager.clone());
        for _ in 0..5 {
            strategy
                .on_file_event(FileEvent { path: file.clone(), kind: FileEventKind::Modified })
                .await;
        }
        assert_eq!(strategy.stats().pending_events, 1);
    }
}
