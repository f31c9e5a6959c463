//! Realtime strategy: watch the project tree and apply every add,
//! change, and unlink as it lands. Events debounce per path; a file
//! whose hash is unchanged after the debounce is skipped by the
//! manager's fingerprint check. A crashed watcher restarts with a delay,
//! a bounded number of times.

use super::{FileEvent, FileEventKind, StrategyStats, WatcherMsg, spawn_watcher};
use crate::error::Result;
use crate::index_manager::IndexManager;
use crate::paths::to_relative;
use dashmap::DashMap;
use notify::RecursiveMode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-path debounce window.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watcher crash recovery: delay between restarts, and the attempt cap.
const RESTART_DELAY: Duration = Duration::from_secs(5);
const MAX_RESTARTS: u32 = 3;

/// How long `flush` waits for in-flight events to drain.
const FLUSH_WAIT: Duration = Duration::from_secs(10);

struct Shared {
    manager: Arc<IndexManager>,
    active: AtomicBool,
    /// Paths currently being handled; prevents concurrent processing of
    /// one path when injection races the watcher.
    processing: DashMap<String, ()>,
    pending: Arc<AtomicUsize>,
    processed: AtomicU64,
}

pub struct RealtimeStrategy {
    shared: Arc<Shared>,
    tx: Option<mpsc::UnboundedSender<WatcherMsg>>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

/// Removes the path from the in-flight set on every exit path.
struct ProcessingGuard<'a> {
    shared: &'a Shared,
    path: String,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.shared.processing.remove(&self.path);
    }
}

impl RealtimeStrategy {
    pub fn new(manager: Arc<IndexManager>) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                active: AtomicBool::new(false),
                processing: DashMap::new(),
                pending: Arc::new(AtomicUsize::new(0)),
                processed: AtomicU64::new(0),
            }),
            tx: None,
            worker: None,
        }
    }

    pub async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx.clone());
        self.shared.active.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        self.worker = Some(tokio::spawn(run_worker(shared, tx, rx)));
        info!("realtime strategy started");
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        info!("realtime strategy stopped");
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub async fn on_file_event(&self, event: FileEvent) {
        if let Some(tx) = &self.tx {
            self.shared.pending.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(WatcherMsg::Events(vec![event]));
        }
    }

    /// Waits for the event queue and in-flight handlers to drain.
    pub async fn flush(&self) -> Result<()> {
        let deadline = std::time::Instant::now() + FLUSH_WAIT;
        while self.shared.pending.load(Ordering::SeqCst) > 0
            || !self.shared.processing.is_empty()
        {
            if std::time::Instant::now() > deadline {
                warn!("realtime flush timed out with events still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    pub fn stats(&self) -> StrategyStats {
        StrategyStats {
            kind: "realtime",
            active: self.is_active(),
            pending_events: self.shared.pending.load(Ordering::SeqCst),
            processed_events: self.shared.processed.load(Ordering::SeqCst),
        }
    }
}

/// Owns the watcher for its whole life, restarting it on failure.
async fn run_worker(
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<WatcherMsg>,
    mut rx: mpsc::UnboundedReceiver<WatcherMsg>,
) {
    let root = shared.manager.project_root().to_path_buf();
    let mut restarts = 0u32;
    let mut watcher = match spawn_watcher(
        &root,
        RecursiveMode::Recursive,
        DEBOUNCE,
        tx.clone(),
        Some(shared.pending.clone()),
    ) {
        Ok(w) => Some(w),
        Err(e) => {
            error!("realtime watcher failed to start: {e}");
            None
        }
    };

    while let Some(msg) = rx.recv().await {
        match msg {
            WatcherMsg::Events(events) => {
                for event in events {
                    handle_event(&shared, &event).await;
                }
                let _ = shared.pending.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                    Some(p.saturating_sub(1))
                });
            }
            WatcherMsg::Failed(message) => {
                warn!("realtime watcher error: {message}");
                drop(watcher.take());
                restarts += 1;
                if restarts > MAX_RESTARTS {
                    error!(
                        "realtime watcher failed {restarts} times, giving up; \
                         file changes will no longer be tracked"
                    );
                    continue;
                }
                tokio::time::sleep(RESTART_DELAY).await;
                match spawn_watcher(
                    &root,
                    RecursiveMode::Recursive,
                    DEBOUNCE,
                    tx.clone(),
                    Some(shared.pending.clone()),
                ) {
                    Ok(w) => {
                        info!("realtime watcher restarted (attempt {restarts})");
                        watcher = Some(w);
                    }
                    Err(e) => error!("realtime watcher restart failed: {e}"),
                }
            }
        }
    }
    drop(watcher);
}

async fn handle_event(shared: &Shared, event: &FileEvent) {
    let relative = to_relative(shared.manager.project_root(), &event.path);
    if relative.is_empty() {
        return;
    }
    if shared.processing.contains_key(&relative) {
        debug!(path = %relative, "event dropped, path already in flight");
        return;
    }
    shared.processing.insert(relative.clone(), ());
    let _guard = ProcessingGuard { shared, path: relative.clone() };

    let outcome = match event.kind {
        FileEventKind::Removed => shared.manager.remove_file(&relative).await.map(|_| 0),
        FileEventKind::Created | FileEventKind::Modified => {
            shared.manager.update_file(&relative).await
        }
    };
    match outcome {
        Ok(chunks) => {
            shared.processed.fetch_add(1, Ordering::SeqCst);
            if chunks > 0 {
                debug!(path = %relative, chunks, "realtime update applied");
            }
        }
        // Excluded or vanished paths are routine here; the watcher sees
        // everything under the root.
        Err(e) if matches!(e.code(), "FILE_EXCLUDED" | "FILE_NOT_FOUND") => {
            debug!(path = %relative, "event skipped: {}", e.code());
        }
        Err(e) => warn!(path = %relative, "realtime update failed: {e}"),
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
    async fn injected_events_update_the_index() {
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        let manager = manager(project.path(), index.path()).await;

        let mut strategy = RealtimeStrategy::new(manager.clone());
        strategy.initialize().await.unwrap();
        strategy.start().await.unwrap();
        assert!(strategy.is_active());

        let file = manager.project_root().join("src/new.rs");
        std::fs::write(&file, "fn fresh_code() {}\n").unwrap();
        strategy
            .on_file_event(FileEvent { path: file.clone(), kind: FileEventKind::Created })
            .await;
        strategy.flush().await.unwrap();

        let files = manager.code_store().vectors.indexed_files().await;
        assert!(files.contains(&"src/new.rs".to_string()));

        std::fs::remove_file(&file).unwrap();
        strategy.on_file_event(FileEvent { path: file, kind: FileEventKind::Removed }).await;
        strategy.flush().await.unwrap();
        let files = manager.code_store().vectors.indexed_files().await;
        assert!(!files.contains(&"src/new.rs".to_string()));

        let stats = strategy.stats();
        assert_eq!(stats.kind, "realtime");
        assert_eq!(stats.pending_events, 0);
        assert!(stats.processed_events >= 2);

        strategy.stop().await;
        assert!(!strategy.is_active());
    }

    #[tokio::test]
    async fn watcher_picks_up_real_changes() {
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        let manager = manager(project.path(), index.path()).await;

        let mut strategy = RealtimeStrategy::new(manager.clone());
        strategy.start().await.unwrap();

        std::fs::write(manager.project_root().join("src/watched.rs"), "fn watched() {}\n")
            .unwrap();

        // Debounce is 500ms; give the watcher room on slow CI.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            strategy.flush().await.unwrap();
            let files = manager.code_store().vectors.indexed_files().await;
            if files.contains(&"src/watched.rs".to_string()) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "watcher never indexed the file");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        strategy.stop().await;
    }
}
