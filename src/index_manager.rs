//! Orchestrates full and incremental indexing:
//! scan -> chunk -> embed (batched) -> write vector + keyword stores ->
//! update fingerprints and the Merkle tree.
//!
//! Full builds move through `idle -> scanning -> chunking -> embedding ->
//! storing -> complete`, with any state able to drop to `failed`. The
//! metadata record checkpoints progress so a crash is detectable at the
//! next start.

use crate::chunker::{self, Chunk, ChunkerSettings};
use crate::config::{ChunkingStrategyKind, Config, FtsEngineKind, layout};
use crate::embedder::{EmbedPurpose, Embedder};
use crate::error::{Error, Result};
use crate::fingerprints::{FingerprintStore, hash_bytes};
use crate::fts::{self, FtsEngine};
use crate::merkle::{FileNode, MerkleTree};
use crate::paths::{PathPolicy, ScanEntry, safe_join, to_relative};
use crate::state::EngineEvent;
use crate::sync::{AsyncMutex, atomic_write_json, indexing_lock};
use crate::vector::VectorStore;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Files processed per pipeline batch. Progress checkpoints, shutdown
/// checks, and cooperative yields happen at these boundaries.
const FILE_BATCH: usize = 16;

/// Safety margin applied to the disk-space estimate.
const DISK_MARGIN: f64 = 1.1;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingState {
    Complete,
    InProgress,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingProgress {
    pub state: IndexingState,
    pub started_at: Option<DateTime<Utc>>,
    pub expected_files: usize,
    pub processed_files: usize,
    pub last_checkpoint: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Default for IndexingProgress {
    fn default() -> Self {
        Self {
            state: IndexingState::Complete,
            started_at: None,
            expected_files: 0,
            processed_files: 0,
            last_checkpoint: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub model: String,
    pub dimension: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_dimension: Option<usize>,
    pub chunking_strategy: ChunkingStrategyKind,
    pub total_files: usize,
    pub total_chunks: usize,
    pub updated_at: DateTime<Utc>,
    pub indexing: IndexingProgress,
    pub failed_embeddings: u64,
}

impl IndexMetadata {
    fn new(config: &Config) -> Self {
        Self {
            model: EmbedPurpose::Code.model_id().to_string(),
            dimension: EmbedPurpose::Code.dimension(),
            docs_model: config.index_docs.then(|| EmbedPurpose::Docs.model_id().to_string()),
            docs_dimension: config.index_docs.then(|| EmbedPurpose::Docs.dimension()),
            chunking_strategy: config.chunking_strategy,
            total_files: 0,
            total_chunks: 0,
            updated_at: Utc::now(),
            indexing: IndexingProgress::default(),
            failed_embeddings: 0,
        }
    }

    pub fn load(path: &std::path::Path) -> Option<Self> {
        let json = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&json).ok()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FileError {
    pub path: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DocsCounts {
    pub files: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub files: usize,
    pub chunks: usize,
    pub duration_ms: u64,
    pub error_count: usize,
    pub errors: Vec<FileError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs: Option<DocsCounts>,
}

// ---------------------------------------------------------------------------
// Store set: one vector table plus optional keyword engine
// ---------------------------------------------------------------------------

pub struct StoreSet {
    pub vectors: Arc<VectorStore>,
    pub fts: Option<Arc<AsyncMutex<Box<dyn FtsEngine>>>>,
    pub fingerprints: parking_lot::Mutex<FingerprintStore>,
    pub purpose: EmbedPurpose,
}

impl StoreSet {
    async fn delete_path(&self, relative_path: &str) -> Result<usize> {
        let removed = self.vectors.delete_by_path(relative_path).await?;
        if let Some(fts) = &self.fts {
            fts.acquire().await.remove_by_path(relative_path)?;
        }
        Ok(removed)
    }

    async fn insert(&self, records: Vec<(Chunk, Vec<f32>)>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let chunks: Vec<Chunk> = records.iter().map(|(c, _)| c.clone()).collect();
        let inserted = self.vectors.insert_chunks(records).await?;
        if let Some(fts) = &self.fts {
            fts.acquire().await.add_chunks(&chunks)?;
        }
        Ok(inserted)
    }
}

// ---------------------------------------------------------------------------
// Per-file preparation (blocking work)
// ---------------------------------------------------------------------------

struct FilePrep {
    relative_path: String,
    hash: String,
    size: u64,
    mtime: u64,
    chunks: Vec<Chunk>,
    is_doc: bool,
}

fn prepare_file(
    root: &std::path::Path,
    entry: &ScanEntry,
    strategy: ChunkingStrategyKind,
    settings: &ChunkerSettings,
) -> std::result::Result<FilePrep, FileError> {
    let abs = root.join(&entry.relative_path);
    let content = std::fs::read_to_string(&abs).map_err(|e| FileError {
        path: entry.relative_path.clone(),
        code: if e.kind() == std::io::ErrorKind::PermissionDenied {
            "PERMISSION_DENIED"
        } else {
            "FILE_NOT_FOUND"
        },
        message: e.to_string(),
    })?;
    let mtime = abs
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let chunks = chunker::chunk_file(&entry.relative_path, &content, strategy, settings)
        .map_err(|e| FileError {
            path: entry.relative_path.clone(),
            code: e.code(),
            message: e.developer_message(),
        })?;
    Ok(FilePrep {
        relative_path: entry.relative_path.clone(),
        hash: hash_bytes(content.as_bytes()),
        size: entry.size,
        mtime,
        chunks,
        is_doc: entry.is_doc,
    })
}

// ---------------------------------------------------------------------------
// Index manager
// ---------------------------------------------------------------------------

pub struct IndexManager {
    project_root: PathBuf,
    index_dir: PathBuf,
    config: Config,
    policy: PathPolicy,
    embedder: Arc<dyn Embedder>,
    code: StoreSet,
    docs: Option<StoreSet>,
    merkle: parking_lot::Mutex<MerkleTree>,
    metadata: parking_lot::Mutex<IndexMetadata>,
    shutdown: AtomicBool,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl IndexManager {
    pub async fn open(
        project_root: PathBuf,
        index_dir: PathBuf,
        config: Config,
        embedder: Arc<dyn Embedder>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&index_dir)?;
        let policy = PathPolicy::new(project_root.clone(), &config)?;

        let metadata = IndexMetadata::load(&index_dir.join(layout::METADATA))
            .unwrap_or_else(|| IndexMetadata::new(&config));

        let code_vectors = Arc::new(
            VectorStore::open(index_dir.join(layout::VECTORS_DIR), EmbedPurpose::Code.dimension())
                .await?,
        );
        let code_fts = if config.hybrid_search.enabled {
            let engine = fts::open_engine(
                config.hybrid_search.fts_engine,
                &index_dir.join(layout::FTS_DIR),
                metadata.total_chunks,
            )?;
            Some(Arc::new(AsyncMutex::new(engine)))
        } else {
            None
        };
        let code = StoreSet {
            vectors: code_vectors,
            fts: code_fts,
            fingerprints: parking_lot::Mutex::new(FingerprintStore::load(
                index_dir.join(layout::FINGERPRINTS),
            )),
            purpose: EmbedPurpose::Code,
        };

        let docs = if config.index_docs {
            Some(StoreSet {
                vectors: Arc::new(
                    VectorStore::open(
                        index_dir.join(layout::DOCS_VECTORS_DIR),
                        EmbedPurpose::Docs.dimension(),
                    )
                    .await?,
                ),
                fts: None,
                fingerprints: parking_lot::Mutex::new(FingerprintStore::load(
                    index_dir.join(layout::DOCS_FINGERPRINTS),
                )),
                purpose: EmbedPurpose::Docs,
            })
        } else {
            None
        };

        Ok(Arc::new(Self {
            project_root,
            index_dir,
            policy,
            embedder,
            code,
            docs,
            merkle: parking_lot::Mutex::new(MerkleTree::load(&index_dir.join(layout::MERKLE))),
            metadata: parking_lot::Mutex::new(metadata),
            shutdown: AtomicBool::new(false),
            event_tx,
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    pub fn project_root(&self) -> &std::path::Path {
        &self.project_root
    }

    pub fn index_dir(&self) -> &std::path::Path {
        &self.index_dir
    }

    pub fn code_store(&self) -> &StoreSet {
        &self.code
    }

    pub fn docs_store(&self) -> Option<&StoreSet> {
        self.docs.as_ref()
    }

    pub fn metadata(&self) -> IndexMetadata {
        self.metadata.lock().clone()
    }

    pub fn merkle_root(&self) -> String {
        self.merkle.lock().root_hash()
    }

    pub fn merkle_snapshot(&self) -> MerkleTree {
        self.merkle.lock().snapshot()
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    /// Signals cooperative cancellation; in-flight batches finish, the
    /// next batch boundary stops.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Internal("indexing canceled by shutdown".to_string()));
        }
        Ok(())
    }

    fn chunker_settings(&self) -> ChunkerSettings {
        ChunkerSettings::default()
    }

    fn save_metadata(&self) -> Result<()> {
        let metadata = self.metadata.lock().clone();
        atomic_write_json(&self.index_dir.join(layout::METADATA), &metadata, false)
    }

    fn set_indexing_state(&self, state: IndexingState, error_message: Option<String>) {
        let mut metadata = self.metadata.lock();
        metadata.indexing.state = state;
        metadata.indexing.error_message = error_message;
        metadata.indexing.last_checkpoint = Some(Utc::now());
        metadata.updated_at = Utc::now();
    }

    /// Marks the index consistent again, e.g. after a reconcile has
    /// repaired a failed build.
    pub fn set_state_complete(&self) {
        self.set_indexing_state(IndexingState::Complete, None);
        if let Err(e) = self.save_metadata() {
            warn!("metadata save after reconcile failed: {e}");
        }
    }

    fn update_progress(&self, processed_files: usize) {
        let mut metadata = self.metadata.lock();
        metadata.indexing.processed_files = processed_files;
        metadata.indexing.last_checkpoint = Some(Utc::now());
    }

    /// Estimate of vector bytes a build would add, with margin.
    fn disk_preflight(&self, entries: &[ScanEntry]) -> Result<()> {
        let settings = self.chunker_settings();
        let window = (settings.max_chars - settings.overlap).max(1) as u64;
        let estimated_chunks: u64 =
            entries.iter().map(|e| e.size / window + 1).sum();
        let needed = (estimated_chunks as f64
            * EmbedPurpose::Code.dimension() as f64
            * 4.0
            * DISK_MARGIN) as u64;
        let available = fs2::available_space(&self.index_dir)
            .map_err(|e| Error::Internal(format!("disk space probe: {e}")))?;
        if needed > available {
            return Err(Error::DiskFull { needed, available });
        }
        Ok(())
    }

    fn store_for(&self, is_doc: bool) -> Option<&StoreSet> {
        if is_doc { self.docs.as_ref() } else { Some(&self.code) }
    }

    // -----------------------------------------------------------------------
    // Full build
    // -----------------------------------------------------------------------

    /// Full project build. `force` re-embeds every file; otherwise files
    /// whose hash matches the stored fingerprint are skipped.
    pub async fn full_index(&self, force: bool) -> Result<IndexStats> {
        let _guard = indexing_lock().try_begin()?;
        let start = std::time::Instant::now();

        let result = self.full_index_inner(force, start).await;
        match &result {
            Ok(stats) => {
                let _ = self.event_tx.send(EngineEvent::IndexingCompleted {
                    files: stats.files,
                    chunks: stats.chunks,
                    duration_ms: stats.duration_ms,
                });
            }
            Err(e) => {
                self.set_indexing_state(IndexingState::Failed, Some(e.developer_message()));
                let _ = self.save_metadata();
                let _ = self.event_tx.send(EngineEvent::IndexingFailed {
                    error: e.user_message(),
                });
            }
        }
        result
    }

    async fn full_index_inner(&self, force: bool, start: std::time::Instant) -> Result<IndexStats> {
        // scanning
        let entries = self.policy.scan()?;
        info!(files = entries.len(), "scan complete");
        self.disk_preflight(&entries)?;

        {
            let mut metadata = self.metadata.lock();
            metadata.indexing = IndexingProgress {
                state: IndexingState::InProgress,
                started_at: Some(Utc::now()),
                expected_files: entries.len(),
                processed_files: 0,
                last_checkpoint: Some(Utc::now()),
                error_message: None,
            };
        }
        self.save_metadata()?;
        let _ = self.event_tx.send(EngineEvent::IndexingStarted { expected_files: entries.len() });

        let strategy = self.config.chunking_strategy;
        let settings = self.chunker_settings();
        let mut errors: Vec<FileError> = Vec::new();
        let mut processed = 0usize;
        let mut code_counts = DocsCounts::default();
        let mut docs_counts = DocsCounts::default();

        for batch in entries.chunks(FILE_BATCH) {
            self.check_shutdown()?;

            // chunking (parallel, off the reactor)
            let root = self.project_root.clone();
            let batch_entries: Vec<ScanEntry> = batch.to_vec();
            let prepared: Vec<std::result::Result<FilePrep, FileError>> =
                tokio::task::spawn_blocking(move || {
                    batch_entries
                        .par_iter()
                        .map(|entry| prepare_file(&root, entry, strategy, &settings))
                        .collect()
                })
                .await
                .map_err(|e| Error::Internal(format!("chunking task failed: {e}")))?;

            let mut to_store: Vec<FilePrep> = Vec::new();
            for prep in prepared {
                match prep {
                    Ok(prep) => {
                        let unchanged = !force
                            && self
                                .store_for(prep.is_doc)
                                .map(|set| {
                                    set.fingerprints.lock().get(&prep.relative_path)
                                        == Some(prep.hash.as_str())
                                })
                                .unwrap_or(false);
                        if unchanged {
                            if prep.is_doc {
                                docs_counts.files += 1;
                                docs_counts.chunks += prep.chunks.len();
                            } else {
                                code_counts.files += 1;
                                code_counts.chunks += prep.chunks.len();
                            }
                        } else {
                            to_store.push(prep);
                        }
                    }
                    Err(e) => {
                        warn!(path = %e.path, code = e.code, "file failed: {}", e.message);
                        errors.push(e);
                    }
                }
            }

            // embedding + storing
            for prep in to_store {
                let Some(set) = self.store_for(prep.is_doc) else {
                    continue;
                };
                match self.embed_and_store(set, &prep, force).await {
                    Ok(stored) => {
                        if prep.is_doc {
                            docs_counts.files += 1;
                            docs_counts.chunks += stored;
                        } else {
                            code_counts.files += 1;
                            code_counts.chunks += stored;
                        }
                    }
                    Err(e) => errors.push(FileError {
                        path: prep.relative_path.clone(),
                        code: e.code(),
                        message: e.developer_message(),
                    }),
                }
            }

            processed += batch.len();
            self.update_progress(processed);
            self.save_metadata()?;
            let _ = self.event_tx.send(EngineEvent::IndexingProgress {
                processed_files: processed,
                expected_files: entries.len(),
            });
            tokio::task::yield_now().await;
        }

        // Drop records for files that vanished since the last build.
        let on_disk: std::collections::HashSet<&str> =
            entries.iter().map(|e| e.relative_path.as_str()).collect();
        for set in [Some(&self.code), self.docs.as_ref()].into_iter().flatten() {
            let stale: Vec<String> = set
                .fingerprints
                .lock()
                .paths()
                .filter(|p| !on_disk.contains(p))
                .map(|p| p.to_string())
                .collect();
            for path in stale {
                set.delete_path(&path).await?;
                set.fingerprints.lock().delete(&path);
                self.merkle.lock().remove_file(&path);
            }
        }

        // complete
        {
            let mut metadata = self.metadata.lock();
            metadata.total_files = code_counts.files + docs_counts.files;
            metadata.total_chunks = code_counts.chunks + docs_counts.chunks;
            metadata.indexing.state = IndexingState::Complete;
            metadata.indexing.processed_files = processed;
            metadata.updated_at = Utc::now();
        }
        self.save_all().await?;

        info!(
            files = code_counts.files + docs_counts.files,
            chunks = code_counts.chunks + docs_counts.chunks,
            errors = errors.len(),
            "index build complete"
        );

        Ok(IndexStats {
            files: code_counts.files,
            chunks: code_counts.chunks,
            duration_ms: start.elapsed().as_millis() as u64,
            error_count: errors.len(),
            errors,
            docs: self.docs.as_ref().map(|_| docs_counts),
        })
    }

    /// Embeds one prepared file and writes it through the store set.
    /// Failed embeddings are skipped (never stored as zero vectors) and
    /// counted on the index metadata.
    async fn embed_and_store(&self, set: &StoreSet, prep: &FilePrep, replace: bool) -> Result<usize> {
        let known_before = set.fingerprints.lock().has(&prep.relative_path);
        if known_before || replace {
            set.delete_path(&prep.relative_path).await?;
        }

        let texts: Vec<String> = prep.chunks.iter().map(|c| c.text.clone()).collect();
        let embedder = self.embedder.clone();
        let purpose = set.purpose;
        let embeddings = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts, purpose))
            .await
            .map_err(|e| Error::Internal(format!("embedding task failed: {e}")))??;

        let mut records: Vec<(Chunk, Vec<f32>)> = Vec::with_capacity(prep.chunks.len());
        let mut failed = 0u64;
        for (chunk, embedding) in prep.chunks.iter().zip(embeddings) {
            if embedding.ok {
                records.push((chunk.clone(), embedding.vector));
            } else {
                failed += 1;
            }
        }
        if failed > 0 {
            let mut metadata = self.metadata.lock();
            metadata.failed_embeddings += failed;
        }

        let stored = set.insert(records).await?;

        set.fingerprints
            .lock()
            .set(prep.relative_path.clone(), prep.hash.clone());
        self.merkle.lock().add_file(FileNode::new(
            prep.relative_path.clone(),
            prep.size,
            prep.mtime,
            prep.hash.clone(),
            prep.chunks.iter().map(|c| c.content_hash.clone()).collect(),
        ));
        Ok(stored)
    }

    // -----------------------------------------------------------------------
    // Incremental updates
    // -----------------------------------------------------------------------

    /// Re-chunks and re-embeds a single file through the same per-file
    /// pipeline, removing its previous chunks first. Returns the number
    /// of chunks created (0 when the content hash is unchanged).
    pub async fn update_file(&self, relative_path: &str) -> Result<usize> {
        let abs = safe_join(&self.project_root, relative_path)?;
        let relative = to_relative(&self.project_root, &abs);

        let metadata = std::fs::metadata(&abs)
            .map_err(|_| Error::FileNotFound(relative.clone()))?;
        let decision = self.policy.should_index(&relative, metadata.len());
        if !decision.indexable {
            return Err(Error::FileExcluded {
                path: relative,
                reason: decision.reason.to_string(),
            });
        }

        let is_doc = self.policy.is_doc(&relative);
        let Some(set) = self.store_for(is_doc) else {
            return Err(Error::DocsIndexNotFound(relative));
        };

        let content = std::fs::read_to_string(&abs)
            .map_err(|_| Error::FileNotFound(relative.clone()))?;
        let hash = hash_bytes(content.as_bytes());
        if set.fingerprints.lock().get(&relative) == Some(hash.as_str()) {
            return Ok(0);
        }

        let chunks = chunker::chunk_file(
            &relative,
            &content,
            self.config.chunking_strategy,
            &self.chunker_settings(),
        )?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let prep = FilePrep {
            relative_path: relative.clone(),
            hash,
            size: metadata.len(),
            mtime,
            chunks,
            is_doc,
        };
        let stored = self.embed_and_store(set, &prep, true).await?;

        self.flush_sidecars_if_due()?;
        let _ = self.event_tx.send(EngineEvent::FileIndexed {
            path: relative,
            chunks: stored,
        });
        Ok(stored)
    }

    /// Drops every trace of a file from both pipelines.
    pub async fn remove_file(&self, relative_path: &str) -> Result<()> {
        for set in [Some(&self.code), self.docs.as_ref()].into_iter().flatten() {
            set.delete_path(relative_path).await?;
            set.fingerprints.lock().delete(relative_path);
        }
        self.merkle.lock().remove_file(relative_path);
        self.flush_sidecars_if_due()?;
        let _ = self.event_tx.send(EngineEvent::FileRemoved {
            path: relative_path.to_string(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn flush_sidecars_if_due(&self) -> Result<()> {
        self.code.fingerprints.lock().save_if_due()?;
        if let Some(docs) = &self.docs {
            docs.fingerprints.lock().save_if_due()?;
        }
        Ok(())
    }

    /// Writes every piece of persistent state: fingerprints, Merkle
    /// snapshot, metadata, keyword state, vector tables.
    pub async fn save_all(&self) -> Result<()> {
        self.code.fingerprints.lock().save()?;
        if let Some(docs) = &self.docs {
            docs.fingerprints.lock().save()?;
        }
        self.merkle.lock().save(&self.index_dir.join(layout::MERKLE))?;
        self.save_metadata()?;
        for set in [Some(&self.code), self.docs.as_ref()].into_iter().flatten() {
            if let Some(fts) = &set.fts {
                fts.acquire().await.commit()?;
            }
            set.vectors.flush().await?;
        }
        Ok(())
    }

    /// Flush and release store handles. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        self.request_shutdown();
        self.save_all().await?;
        for set in [Some(&self.code), self.docs.as_ref()].into_iter().flatten() {
            if let Some(fts) = &set.fts {
                fts.acquire().await.close()?;
            }
            set.vectors.close().await?;
        }
        Ok(())
    }

    /// Live counts for status reporting.
    pub async fn counts(&self) -> IndexCounts {
        let metadata = self.metadata();
        let code_chunks = self.code.vectors.len().await;
        let code_files = self.code.fingerprints.lock().len();
        let (docs_files, docs_chunks) = match &self.docs {
            Some(docs) => (docs.fingerprints.lock().len(), docs.vectors.len().await),
            None => (0, 0),
        };
        let fts_chunks = match &self.code.fts {
            Some(fts) => fts.acquire().await.len(),
            None => 0,
        };
        let fts_engine = match &self.code.fts {
            Some(fts) => Some(fts.acquire().await.kind()),
            None => None,
        };
        let mut storage_bytes = self.code.vectors.storage_size_bytes().await;
        if let Some(docs) = &self.docs {
            storage_bytes += docs.vectors.storage_size_bytes().await;
        }
        IndexCounts {
            code_files,
            code_chunks,
            docs_files,
            docs_chunks,
            fts_chunks,
            fts_engine,
            storage_bytes,
            failed_embeddings: metadata.failed_embeddings,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexCounts {
    pub code_files: usize,
    pub code_chunks: usize,
    pub docs_files: usize,
    pub docs_chunks: usize,
    pub fts_chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts_engine: Option<FtsEngineKind>,
    pub storage_bytes: u64,
    pub failed_embeddings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;

    async fn manager_for(project: &std::path::Path, index_dir: &std::path::Path) -> Arc<IndexManager> {
        let mut config = Config::default();
        config.hybrid_search.fts_engine = FtsEngineKind::Portable;
        let (tx, _) = broadcast::channel(64);
        IndexManager::open(
            dunce::canonicalize(project).unwrap(),
            index_dir.to_path_buf(),
            config,
            Arc::new(HashEmbedder),
            tx,
        )
        .await
        .unwrap()
    }

    fn seed_project(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/alpha.rs"), "fn alpha() { let x = 1; }\n").unwrap();
        std::fs::write(dir.join("src/beta.rs"), "fn beta() { let y = 2; }\n").unwrap();
        std::fs::write(dir.join("README.md"), "# Project\n\nSearchable docs here.\n").unwrap();
    }

    #[tokio::test]
    async fn full_index_builds_all_stores() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        seed_project(project.path());
        let manager = manager_for(project.path(), index.path()).await;

        let stats = manager.full_index(false).await.unwrap();
        assert_eq!(stats.files, 2);
        assert!(stats.chunks >= 2);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.docs.as_ref().unwrap().files, 1);

        let metadata = manager.metadata();
        assert_eq!(metadata.indexing.state, IndexingState::Complete);
        assert_eq!(metadata.indexing.expected_files, 3);
        assert_eq!(metadata.indexing.processed_files, 3);

        let counts = manager.counts().await;
        assert_eq!(counts.code_files, 2);
        assert_eq!(counts.fts_chunks, counts.code_chunks);
        assert_eq!(counts.docs_files, 1);

        // Fingerprints match the bytes on disk.
        let stored = manager.code_store().fingerprints.lock().snapshot();
        for (path, hash) in stored {
            let bytes = std::fs::read(project.path().join(&path)).unwrap();
            assert_eq!(hash, hash_bytes(&bytes), "{path}");
        }
    }

    #[tokio::test]
    async fn second_index_skips_unchanged_files() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        seed_project(project.path());
        let manager = manager_for(project.path(), index.path()).await;

        manager.full_index(false).await.unwrap();
        let root_before = manager.merkle_root();
        let stats = manager.full_index(false).await.unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.error_count, 0);
        assert_eq!(manager.merkle_root(), root_before);
    }

    #[tokio::test]
    async fn update_file_replaces_chunks_and_fingerprint() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        seed_project(project.path());
        let manager = manager_for(project.path(), index.path()).await;
        manager.full_index(false).await.unwrap();

        let old_hash =
            manager.code_store().fingerprints.lock().get("src/alpha.rs").unwrap().to_string();

        std::fs::write(
            project.path().join("src/alpha.rs"),
            "fn alpha_two() { let z = 3; }\n",
        )
        .unwrap();
        let created = manager.update_file("src/alpha.rs").await.unwrap();
        assert!(created > 0);

        let new_hash =
            manager.code_store().fingerprints.lock().get("src/alpha.rs").unwrap().to_string();
        assert_ne!(old_hash, new_hash);

        // Unchanged content is a no-op.
        assert_eq!(manager.update_file("src/alpha.rs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_file_rejects_outside_and_excluded_paths() {
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        seed_project(project.path());
        std::fs::write(project.path().join("image.png"), [1u8, 2, 3]).unwrap();
        let manager = manager_for(project.path(), index.path()).await;

        let err = manager.update_file("../outside.rs").await.unwrap_err();
        assert_eq!(err.code(), "PATH_TRAVERSAL");
        let err = manager.update_file("image.png").await.unwrap_err();
        assert_eq!(err.code(), "FILE_EXCLUDED");
        let err = manager.update_file("src/missing.rs").await.unwrap_err();
        assert_eq!(err.code(), "FILE_NOT_FOUND");
    }

    #[tokio::test]
    async fn remove_file_clears_both_stores() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        seed_project(project.path());
        let manager = manager_for(project.path(), index.path()).await;
        manager.full_index(false).await.unwrap();

        manager.remove_file("src/alpha.rs").await.unwrap();

        let files = manager.code_store().vectors.indexed_files().await;
        assert!(!files.contains(&"src/alpha.rs".to_string()));
        assert!(!manager.code_store().fingerprints.lock().has("src/alpha.rs"));
        let hits = manager
            .code_store()
            .fts
            .as_ref()
            .unwrap()
            .acquire()
            .await
            .search("alpha", 10)
            .unwrap();
        assert!(hits.iter().all(|h| h.path != "src/alpha.rs"));
    }

    #[tokio::test]
    async fn full_index_drops_deleted_files() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        seed_project(project.path());
        let manager = manager_for(project.path(), index.path()).await;
        manager.full_index(false).await.unwrap();

        std::fs::remove_file(project.path().join("src/beta.rs")).unwrap();
        manager.full_index(false).await.unwrap();

        let files = manager.code_store().vectors.indexed_files().await;
        assert!(!files.contains(&"src/beta.rs".to_string()));
        assert!(!manager.code_store().fingerprints.lock().has("src/beta.rs"));
    }

    #[tokio::test]
    async fn oversized_file_fails_alone() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let project = tempfile::TempDir::new().unwrap();
        let index = tempfile::TempDir::new().unwrap();
        seed_project(project.path());
        // Enough lines to blow through the per-file chunk cap.
        let big: String = (0..100_000).map(|i| format!("let v{i} = {i};\n")).collect();
        std::fs::write(project.path().join("src/huge.rs"), big).unwrap();
        let manager = manager_for(project.path(), index.path()).await;

        let stats = manager.full_index(false).await.unwrap();
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.errors[0].code, "RESOURCE_LIMIT");
        assert_eq!(stats.errors[0].path, "src/huge.rs");
        // The rest of the batch still indexed.
        assert_eq!(stats.files, 2);
    }
}
