//! Commit-triggered strategy: watches only the file recording the
//! repository's HEAD history and reconciles the whole index when it
//! moves. Checkouts, merges, and rebases all funnel through that file,
//! so one debounced reconcile covers arbitrarily large diffs.

use super::{FileEvent, StrategyStats, WatcherMsg, spawn_watcher};
use crate::error::{Error, Result};
use crate::index_manager::IndexManager;
use crate::integrity::IntegrityEngine;
use notify::RecursiveMode;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// HEAD log changes debounce window.
const DEBOUNCE: Duration = Duration::from_secs(2);

/// How long `flush` waits for an in-flight reconcile.
const FLUSH_WAIT: Duration = Duration::from_secs(30);

struct Shared {
    integrity: Arc<IntegrityEngine>,
    active: AtomicBool,
    processed: AtomicU64,
}

pub struct GitStrategy {
    manager: Arc<IndexManager>,
    shared: Arc<Shared>,
    head_log: Option<PathBuf>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl GitStrategy {
    pub fn new(manager: Arc<IndexManager>, integrity: Arc<IntegrityEngine>) -> Self {
        Self {
            manager,
            shared: Arc::new(Shared {
                integrity,
                active: AtomicBool::new(false),
                processed: AtomicU64::new(0),
            }),
            head_log: None,
            worker: None,
        }
    }

    /// Fails cleanly when the project is not a repository.
    pub async fn initialize(&mut self) -> Result<()> {
        let head_log = self.manager.project_root().join(".git").join("logs").join("HEAD");
        if !head_log.is_file() {
            return Err(Error::ProjectNotDetected(format!(
                "{} has no .git/logs/HEAD; the git strategy needs a repository",
                self.manager.project_root().display()
            )));
        }
        self.head_log = Some(head_log);
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(head_log) = self.head_log.clone() else {
            return Err(Error::ProjectNotDetected(
                "git strategy started before initialize".to_string(),
            ));
        };
        self.shared.active.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        self.worker = Some(tokio::spawn(run_worker(shared, head_log)));
        info!("git strategy started");
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        info!("git strategy stopped");
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Any event on the HEAD log means "a commit landed"; the payload
    /// path is irrelevant.
    pub async fn on_file_event(&self, _event: FileEvent) {
        reconcile_now(&self.shared).await;
    }

    /// Waits for an in-flight reconcile rather than starting one; reads
    /// between commits are already consistent.
    pub async fn flush(&self) -> Result<()> {
        let deadline = std::time::Instant::now() + FLUSH_WAIT;
        while self.shared.integrity.is_active() {
            if std::time::Instant::now() > deadline {
                warn!("git flush timed out waiting for reconcile");
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(())
    }

    pub fn stats(&self) -> StrategyStats {
        StrategyStats {
            kind: "git",
            active: self.is_active(),
            pending_events: usize::from(self.shared.integrity.is_active()),
            processed_events: self.shared.processed.load(Ordering::SeqCst),
        }
    }
}

async fn reconcile_now(shared: &Shared) {
    match shared.integrity.reconcile().await {
        Ok(report) => {
            shared.processed.fetch_add(1, Ordering::SeqCst);
            info!(
                added = report.added,
                modified = report.modified,
                removed = report.removed,
                duration_ms = report.duration_ms,
                "commit-triggered reconcile complete"
            );
        }
        Err(e) if e.code() == "INDEXING_IN_PROGRESS" => {
            // Another reconcile is already covering this commit.
        }
        Err(e) => warn!("commit-triggered reconcile failed: {e}"),
    }
}

async fn run_worker(shared: Arc<Shared>, head_log: PathBuf) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher =
        match spawn_watcher(&head_log, RecursiveMode::NonRecursive, DEBOUNCE, tx, None) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("git HEAD watcher failed to start: {e}");
                None
            }
        };

    while let Some(msg) = rx.recv().await {
        match msg {
            WatcherMsg::Events(_) => reconcile_now(&shared).await,
            WatcherMsg::Failed(message) => warn!("git watcher error: {message}"),
        }
    }
}
