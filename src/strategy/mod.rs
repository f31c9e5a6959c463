//! Update-triggering policies. Three variants share one capability set
//! (initialize / start / stop / on_file_event / flush / stats):
//!
//! - `realtime` applies every filesystem event as it lands (debounced);
//! - `lazy` queues events into a persistent dirty set and flushes on an
//!   idle timer or on demand;
//! - `git` watches the repository HEAD log and reconciles on commits.
//!
//! `flush` is the external synchronization point searches take before
//! reading.

mod git;
mod lazy;
mod realtime;

pub use git::GitStrategy;
pub use lazy::LazyStrategy;
pub use realtime::RealtimeStrategy;

use crate::config::IndexingStrategyKind;
use crate::error::Result;
use crate::index_manager::IndexManager;
use crate::integrity::IntegrityEngine;
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, DebouncedEvent};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub kind: &'static str,
    pub active: bool,
    pub pending_events: usize,
    pub processed_events: u64,
}

/// Strategy variant selected by configuration.
pub enum Strategy {
    Realtime(RealtimeStrategy),
    Lazy(LazyStrategy),
    Git(GitStrategy),
}

impl Strategy {
    pub fn build(
        kind: IndexingStrategyKind,
        manager: Arc<IndexManager>,
        integrity: Arc<IntegrityEngine>,
    ) -> Self {
        match kind {
            IndexingStrategyKind::Realtime => Strategy::Realtime(RealtimeStrategy::new(manager)),
            IndexingStrategyKind::Lazy => Strategy::Lazy(LazyStrategy::new(manager)),
            IndexingStrategyKind::Git => Strategy::Git(GitStrategy::new(manager, integrity)),
        }
    }

    pub fn kind(&self) -> IndexingStrategyKind {
        match self {
            Strategy::Realtime(_) => IndexingStrategyKind::Realtime,
            Strategy::Lazy(_) => IndexingStrategyKind::Lazy,
            Strategy::Git(_) => IndexingStrategyKind::Git,
        }
    }

    pub async fn initialize(&mut self) -> Result<()> {
        match self {
            Strategy::Realtime(s) => s.initialize().await,
            Strategy::Lazy(s) => s.initialize().await,
            Strategy::Git(s) => s.initialize().await,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        match self {
            Strategy::Realtime(s) => s.start().await,
            Strategy::Lazy(s) => s.start().await,
            Strategy::Git(s) => s.start().await,
        }
    }

    pub async fn stop(&mut self) {
        match self {
            Strategy::Realtime(s) => s.stop().await,
            Strategy::Lazy(s) => s.stop().await,
            Strategy::Git(s) => s.stop().await,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Strategy::Realtime(s) => s.is_active(),
            Strategy::Lazy(s) => s.is_active(),
            Strategy::Git(s) => s.is_active(),
        }
    }

    /// Injects an event as if the watcher had produced it.
    pub async fn on_file_event(&self, event: FileEvent) {
        match self {
            Strategy::Realtime(s) => s.on_file_event(event).await,
            Strategy::Lazy(s) => s.on_file_event(event).await,
            Strategy::Git(s) => s.on_file_event(event).await,
        }
    }

    /// Applies everything pending so a following read sees committed
    /// state.
    pub async fn flush(&self) -> Result<()> {
        match self {
            Strategy::Realtime(s) => s.flush().await,
            Strategy::Lazy(s) => s.flush().await,
            Strategy::Git(s) => s.flush().await,
        }
    }

    pub fn stats(&self) -> StrategyStats {
        match self {
            Strategy::Realtime(s) => s.stats(),
            Strategy::Lazy(s) => s.stats(),
            Strategy::Git(s) => s.stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared watcher plumbing
// ---------------------------------------------------------------------------

/// Messages a watcher pushes into a strategy's worker.
pub(crate) enum WatcherMsg {
    Events(Vec<FileEvent>),
    /// The underlying watcher errored and should be restarted.
    Failed(String),
}

pub(crate) fn classify(event: &DebouncedEvent) -> Option<FileEventKind> {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) => Some(FileEventKind::Created),
        EventKind::Modify(_) => Some(FileEventKind::Modified),
        EventKind::Remove(_) => Some(FileEventKind::Removed),
        _ => None,
    }
}

#[cfg(not(windows))]
pub(crate) type Watcher =
    notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::FileIdMap>;
#[cfg(windows)]
pub(crate) type Watcher =
    notify_debouncer_full::Debouncer<notify::PollWatcher, notify_debouncer_full::FileIdMap>;

/// Polling interval for platforms without reliable native events
/// (network drives on Windows-like filesystems).
#[cfg(windows)]
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Starts a debounced watcher that forwards classified events into `tx`.
/// The returned handle owns the watcher thread; dropping it stops
/// watching. `pending` is incremented per forwarded batch so flush can
/// observe events that are queued but not yet handled.
pub(crate) fn spawn_watcher(
    path: &Path,
    recursive: RecursiveMode,
    debounce: Duration,
    tx: mpsc::UnboundedSender<WatcherMsg>,
    pending: Option<Arc<std::sync::atomic::AtomicUsize>>,
) -> Result<Watcher> {
    let handler = move |result: DebounceEventResult| match result {
        Ok(events) => {
            // Collapse to one event per path; the last kind wins.
            let mut per_path: std::collections::HashMap<PathBuf, FileEventKind> =
                std::collections::HashMap::new();
            for event in &events {
                let Some(kind) = classify(event) else { continue };
                for path in &event.paths {
                    per_path.insert(path.clone(), kind);
                }
            }
            if !per_path.is_empty() {
                let batch =
                    per_path.into_iter().map(|(path, kind)| FileEvent { path, kind }).collect();
                if let Some(pending) = &pending {
                    pending.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                let _ = tx.send(WatcherMsg::Events(batch));
            }
        }
        Err(errors) => {
            let joined =
                errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            let _ = tx.send(WatcherMsg::Failed(joined));
        }
    };

    #[cfg(not(windows))]
    let mut watcher = notify_debouncer_full::new_debouncer(debounce, None, handler)
        .map_err(|e| crate::error::Error::Internal(format!("watcher init: {e}")))?;
    #[cfg(windows)]
    let mut watcher = notify_debouncer_full::new_debouncer_opt(
        debounce,
        None,
        handler,
        notify_debouncer_full::FileIdMap::new(),
        notify::Config::default().with_poll_interval(POLL_INTERVAL),
    )
    .map_err(|e| crate::error::Error::Internal(format!("watcher init: {e}")))?;

    watcher
        .watch(path, recursive)
        .map_err(|e| crate::error::Error::Internal(format!("watch {}: {e}", path.display())))?;
    Ok(watcher)
}
