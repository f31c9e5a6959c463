//! Concurrency and shutdown primitives shared across the engine:
//! the per-store async mutex, the process-wide indexing lock, atomic
//! file writes, and the LIFO cleanup registry.

use crate::error::{Error, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Async mutex
// ---------------------------------------------------------------------------

/// Thin wrapper over `tokio::sync::Mutex` adding try/timeout acquisition.
/// One instance guards each vector store and FTS engine; a process-wide
/// instance serializes full index builds.
pub struct AsyncMutex<T> {
    inner: tokio::sync::Mutex<T>,
}

impl<T> AsyncMutex<T> {
    pub fn new(value: T) -> Self {
        Self { inner: tokio::sync::Mutex::new(value) }
    }

    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, T> {
        self.inner.lock().await
    }

    pub fn try_acquire(&self) -> Option<tokio::sync::MutexGuard<'_, T>> {
        self.inner.try_lock().ok()
    }

    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<tokio::sync::MutexGuard<'_, T>> {
        tokio::time::timeout(timeout, self.inner.lock())
            .await
            .map_err(|_| Error::Internal(format!("lock acquisition timed out after {timeout:?}")))
    }

    pub async fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }
}

// ---------------------------------------------------------------------------
// Process-wide indexing lock
// ---------------------------------------------------------------------------

/// Prevents two full (re)index runs from overlapping. Incremental
/// single-file updates do not take this lock; they serialize through
/// the per-store mutexes instead.
pub struct IndexingLock {
    busy: AtomicBool,
}

pub struct IndexingGuard<'a> {
    lock: &'a IndexingLock,
}

impl IndexingLock {
    const fn new() -> Self {
        Self { busy: AtomicBool::new(false) }
    }

    /// Claims the lock or fails with `INDEXING_IN_PROGRESS`.
    pub fn try_begin(&self) -> Result<IndexingGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::IndexingInProgress);
        }
        Ok(IndexingGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for IndexingGuard<'_> {
    fn drop(&mut self) {
        self.lock.busy.store(false, Ordering::SeqCst);
    }
}

pub fn indexing_lock() -> &'static IndexingLock {
    static LOCK: IndexingLock = IndexingLock::new();
    &LOCK
}

// ---------------------------------------------------------------------------
// Atomic file writes
// ---------------------------------------------------------------------------

/// Writes `bytes` to `target` via a uniquely named temp file in the same
/// directory, then renames over the target. The target is never observed
/// half-written; on failure the temp file is unlinked.
pub fn atomic_write(target: &Path, bytes: &[u8], fsync: bool) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let name = target
        .file_name()
        .ok_or_else(|| Error::Internal(format!("atomic write to non-file path {target:?}")))?
        .to_string_lossy()
        .to_string();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let tmp = target.with_file_name(format!("{name}.tmp.{millis}.{}", std::process::id()));

    let result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        if fsync {
            file.sync_all()?;
        }
        drop(file);
        std::fs::rename(&tmp, target)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

pub fn atomic_write_json<T: Serialize>(target: &Path, value: &T, fsync: bool) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    atomic_write(target, &json, fsync)
}

// ---------------------------------------------------------------------------
// Cleanup registry
// ---------------------------------------------------------------------------

type CleanupHandler = std::sync::Arc<dyn Fn() + Send + Sync>;

/// Shutdown handlers, run last-registered-first. Handlers must be
/// idempotent: explicit close paths unregister, but a close racing a
/// signal may still run a handler twice.
pub struct CleanupRegistry {
    handlers: parking_lot::Mutex<Vec<(u64, &'static str, CleanupHandler)>>,
    next_id: AtomicU64,
}

impl CleanupRegistry {
    fn new() -> Self {
        Self {
            handlers: parking_lot::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a handler; returns a token for `unregister`.
    pub fn register(&self, name: &'static str, f: impl Fn() + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, name, std::sync::Arc::new(f)));
        id
    }

    pub fn unregister(&self, id: u64) {
        self.handlers.lock().retain(|(hid, _, _)| *hid != id);
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Runs all registered handlers in LIFO order, each bounded by
    /// `per_handler`. A hung handler is abandoned, not awaited forever.
    pub async fn run_cleanup(&self, per_handler: Duration) {
        let handlers: Vec<(u64, &'static str, CleanupHandler)> = {
            let mut guard = self.handlers.lock();
            guard.drain(..).rev().collect()
        };
        for (_, name, handler) in handlers {
            debug!(handler = name, "running cleanup handler");
            let joined = tokio::time::timeout(
                per_handler,
                tokio::task::spawn_blocking(move || handler()),
            )
            .await;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(handler = name, "cleanup handler panicked: {e}"),
                Err(_) => warn!(handler = name, "cleanup handler timed out after {per_handler:?}"),
            }
        }
    }
}

pub fn cleanup_registry() -> &'static CleanupRegistry {
    static REGISTRY: OnceLock<CleanupRegistry> = OnceLock::new();
    REGISTRY.get_or_init(CleanupRegistry::new)
}

/// The indexing lock is process-wide, so tests that run full builds
/// serialize through this to avoid cross-test collisions.
#[cfg(test)]
pub(crate) fn test_build_serial() -> &'static tokio::sync::Mutex<()> {
    static SERIAL: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    SERIAL.get_or_init(|| tokio::sync::Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn indexing_lock_rejects_second_claim() {
        let lock = IndexingLock::new();
        let guard = lock.try_begin().unwrap();
        assert!(matches!(lock.try_begin(), Err(Error::IndexingInProgress)));
        drop(guard);
        assert!(lock.try_begin().is_ok());
    }

    #[tokio::test]
    async fn async_mutex_try_acquire() {
        let mutex = AsyncMutex::new(0u32);
        let guard = mutex.acquire().await;
        assert!(mutex.try_acquire().is_none());
        drop(guard);
        assert!(mutex.try_acquire().is_some());
    }

    #[tokio::test]
    async fn async_mutex_acquire_timeout_expires() {
        let mutex = AsyncMutex::new(());
        let _held = mutex.acquire().await;
        let err = mutex.acquire_timeout(Duration::from_millis(20)).await;
        assert!(err.is_err());
    }

    #[test]
    fn atomic_write_replaces_and_cleans_temp() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("nested").join("data.json");

        atomic_write(&target, b"first", false).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");

        atomic_write(&target, b"second", true).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");

        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn cleanup_runs_lifo_and_unregisters() {
        let registry = CleanupRegistry::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o1 = order.clone();
        registry.register("first", move || o1.lock().push(1));
        let o2 = order.clone();
        registry.register("second", move || o2.lock().push(2));
        let o3 = order.clone();
        let token = registry.register("third", move || o3.lock().push(3));

        registry.unregister(token);
        registry.run_cleanup(Duration::from_secs(1)).await;

        assert_eq!(*order.lock(), vec![2, 1]);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn cleanup_survives_slow_handler() {
        let registry = CleanupRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));

        registry.register("slow", || std::thread::sleep(Duration::from_secs(5)));
        let r = ran.clone();
        registry.register("fast", move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        registry.run_cleanup(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
