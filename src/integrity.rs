//! Drift detection and repair: compares the filesystem (under policy)
//! with stored fingerprints and replays the difference through the index
//! manager. Runs at orchestrator start, on demand from the
//! commit-triggered strategy, and whenever a read may observe a stale
//! index.

use crate::error::{Error, Result};
use crate::index_manager::{FileError, IndexManager};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Default)]
pub struct DriftReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub in_sync: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub errors: Vec<FileError>,
    pub duration_ms: u64,
}

pub struct IntegrityEngine {
    manager: Arc<IndexManager>,
    active: AtomicBool,
}

/// Resets the active flag on every exit path, including panics.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl IntegrityEngine {
    pub fn new(manager: Arc<IndexManager>) -> Self {
        Self { manager, active: AtomicBool::new(false) }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Hashes of every indexable file currently on disk. Files that fail
    /// to hash (permissions, races) are reported as `added` so a later
    /// pass retries them instead of silently dropping them.
    async fn disk_hashes(&self) -> Result<(BTreeMap<String, String>, Vec<String>)> {
        let entries = self.manager.policy().scan()?;
        let root = self.manager.project_root().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut unreadable = Vec::new();
            let hashed: Vec<(String, Option<String>)> = entries
                .par_iter()
                .map(|entry| {
                    let hash = crate::fingerprints::hash_file(&root.join(&entry.relative_path));
                    (entry.relative_path.clone(), hash.ok())
                })
                .collect();
            let mut map = BTreeMap::new();
            for (path, hash) in hashed {
                match hash {
                    Some(hash) => {
                        map.insert(path, hash);
                    }
                    None => {
                        warn!(path = %path, "could not hash file, treating as added");
                        unreadable.push(path);
                    }
                }
            }
            Ok((map, unreadable))
        })
        .await
        .map_err(|e| Error::Internal(format!("hashing task failed: {e}")))?
    }

    /// Set difference between the filesystem and the stored fingerprints
    /// (code and docs combined).
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let (disk, unreadable) = self.disk_hashes().await?;

        let mut stored = self.manager.code_store().fingerprints.lock().snapshot();
        if let Some(docs) = self.manager.docs_store() {
            stored.extend(docs.fingerprints.lock().snapshot());
        }

        let mut report = DriftReport::default();
        for (path, hash) in &disk {
            match stored.get(path) {
                None => report.added.push(path.clone()),
                Some(known) if known != hash => report.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in stored.keys() {
            if !disk.contains_key(path) {
                report.removed.push(path.clone());
            }
        }
        report.added.extend(unreadable);
        report.in_sync =
            report.added.is_empty() && report.modified.is_empty() && report.removed.is_empty();
        Ok(report)
    }

    /// Applies the current drift through the index manager. Per-file
    /// failures are collected, never fatal for the pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::IndexingInProgress);
        }
        let _guard = ActiveGuard(&self.active);
        let start = std::time::Instant::now();

        let drift = self.check_drift().await?;
        let mut report = ReconcileReport {
            added: 0,
            modified: 0,
            removed: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        // Deletions first: a rename shows up as removed + added, and the
        // stores must not briefly hold both.
        for path in &drift.removed {
            match self.manager.remove_file(path).await {
                Ok(()) => report.removed += 1,
                Err(e) => report.errors.push(FileError {
                    path: path.clone(),
                    code: e.code(),
                    message: e.developer_message(),
                }),
            }
        }
        for path in &drift.added {
            match self.manager.update_file(path).await {
                Ok(_) => report.added += 1,
                Err(e) => report.errors.push(FileError {
                    path: path.clone(),
                    code: e.code(),
                    message: e.developer_message(),
                }),
            }
        }
        for path in &drift.modified {
            match self.manager.update_file(path).await {
                // Unchanged content still counts as reconciled.
                Ok(_) => report.modified += 1,
                Err(e) => report.errors.push(FileError {
                    path: path.clone(),
                    code: e.code(),
                    message: e.developer_message(),
                }),
            }
        }

        self.manager.save_all().await?;
        report.duration_ms = start.elapsed().as_millis() as u64;
        if report.added + report.modified + report.removed > 0 {
            info!(
                added = report.added,
                modified = report.modified,
                removed = report.removed,
                errors = report.errors.len(),
                "reconcile applied"
            );
        }
        Ok(report)
    }
}
