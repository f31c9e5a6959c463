//! Owns the engine for one project: the index manager, the integrity
//! engine, and the active indexing strategy. References flow downward
//! only; strategies hold the manager by handle. Every read goes through
//! `flush` first so results reflect the committed disk state.

use crate::config::{Config, IndexingStrategyKind, layout, index_dir_for, storage_root};
use crate::embedder::{DeviceInfo, EmbedPurpose, Embedder};
use crate::error::{Error, Result};
use crate::index_manager::{IndexManager, IndexStats, IndexingState};
use crate::integrity::{DriftReport, IntegrityEngine, ReconcileReport};
use crate::paths::canonicalize_project;
use crate::search::{self, SearchMode, SearchOutcome, SearchRequest};
use crate::state::EngineEvent;
use crate::strategy::{Strategy, StrategyStats};
use crate::sync::{AsyncMutex, cleanup_registry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Caller-facing search parameters, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub top_k: Option<usize>,
    pub mode: Option<String>,
    pub alpha: Option<f64>,
    pub compact: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<crate::search::SearchHit>,
    pub query: String,
    pub total_results: usize,
    pub search_time_ms: u64,
    pub search_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Compact responses trim chunk text to roughly this many characters.
const COMPACT_TEXT_CHARS: usize = 160;

pub struct Orchestrator {
    project_root: PathBuf,
    index_dir: PathBuf,
    manager: Arc<IndexManager>,
    integrity: Arc<IntegrityEngine>,
    strategy: AsyncMutex<Option<Strategy>>,
    event_tx: broadcast::Sender<EngineEvent>,
    cleanup_token: parking_lot::Mutex<Option<u64>>,
}

impl Orchestrator {
    /// Opens an existing index and heals any drift accumulated while the
    /// service was down.
    pub async fn open(project_root: &Path, embedder: Arc<dyn Embedder>) -> Result<Arc<Self>> {
        let root = canonicalize_project(project_root)?;
        let index_dir = index_dir_for(&storage_root(), &root);
        if !index_dir.join(layout::METADATA).exists() {
            return Err(Error::IndexNotFound(root.to_string_lossy().to_string()));
        }
        let config = match Config::load(&index_dir.join(layout::CONFIG)) {
            Ok(config) => config,
            Err(e) => {
                warn!("config unreadable ({e}), using defaults");
                Config::default()
            }
        };

        let orchestrator = Self::assemble(root, index_dir, config, embedder).await?;

        // Restart drift: the filesystem may have moved while we were
        // not watching. A build interrupted mid-flight also lands here
        // because its state reads in_progress/failed.
        match orchestrator.integrity.check_drift().await {
            Ok(drift) if !drift.in_sync => {
                info!(
                    added = drift.added.len(),
                    modified = drift.modified.len(),
                    removed = drift.removed.len(),
                    "healing restart drift"
                );
                match orchestrator.integrity.reconcile().await {
                    Ok(_) => orchestrator.manager.set_state_complete(),
                    Err(e) => warn!("restart reconcile failed: {e}"),
                }
            }
            Ok(_) => {
                // Consistent on disk; clear any interrupted-build marker.
                if orchestrator.manager.metadata().indexing.state != IndexingState::Complete {
                    orchestrator.manager.set_state_complete();
                }
            }
            Err(e) => warn!("restart drift check failed: {e}"),
        }

        let strategy_kind = orchestrator.manager.config().indexing_strategy;
        orchestrator.set_strategy(strategy_kind).await?;
        Ok(orchestrator)
    }

    /// Creates a fresh index: configuration is persisted, the full build
    /// runs with no strategy active, then the configured strategy
    /// starts.
    pub async fn create(
        project_root: &Path,
        config: Config,
        embedder: Arc<dyn Embedder>,
    ) -> Result<(Arc<Self>, IndexStats)> {
        config.validate()?;
        let root = canonicalize_project(project_root)?;
        let index_dir = index_dir_for(&storage_root(), &root);
        if index_dir.join(layout::METADATA).exists() {
            return Err(Error::IndexExists(root.to_string_lossy().to_string()));
        }
        std::fs::create_dir_all(index_dir.join(layout::LOGS_DIR))?;
        config.save(&index_dir.join(layout::CONFIG))?;

        let orchestrator = Self::assemble(root, index_dir, config, embedder).await?;

        // The strategy is constructed (and validated) up front but only
        // started once the build finishes; until then nothing watches.
        let kind = orchestrator.manager.config().indexing_strategy;
        let mut strategy =
            Strategy::build(kind, orchestrator.manager.clone(), orchestrator.integrity.clone());
        let created = async {
            strategy.initialize().await?;
            let stats = orchestrator.manager.full_index(false).await?;
            strategy.start().await?;
            Ok::<_, Error>(stats)
        }
        .await;

        match created {
            Ok(stats) => {
                *orchestrator.strategy.acquire().await = Some(strategy);
                Ok((orchestrator, stats))
            }
            Err(e) => {
                // A failed create leaves nothing behind, so a retry is
                // a clean slate.
                orchestrator.unregister_cleanup();
                let _ = orchestrator.manager.close().await;
                let _ = std::fs::remove_dir_all(&orchestrator.index_dir);
                Err(e)
            }
        }
    }

    async fn assemble(
        root: PathBuf,
        index_dir: PathBuf,
        config: Config,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        let (event_tx, _) = broadcast::channel(256);
        let manager = IndexManager::open(
            root.clone(),
            index_dir.clone(),
            config,
            embedder,
            event_tx.clone(),
        )
        .await?;
        let integrity = Arc::new(IntegrityEngine::new(manager.clone()));

        let orchestrator = Arc::new(Self {
            project_root: root,
            index_dir,
            manager,
            integrity,
            strategy: AsyncMutex::new(None),
            event_tx,
            cleanup_token: parking_lot::Mutex::new(None),
        });

        // Shutdown safety net; the explicit shutdown path unregisters it.
        let weak = Arc::downgrade(&orchestrator);
        let handle = tokio::runtime::Handle::current();
        let token = cleanup_registry().register("orchestrator", move || {
            if let Some(orchestrator) = weak.upgrade() {
                let handle = handle.clone();
                let _ = handle.block_on(async {
                    orchestrator.manager.request_shutdown();
                    orchestrator.manager.close().await
                });
            }
        });
        *orchestrator.cleanup_token.lock() = Some(token);
        Ok(orchestrator)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Strategy lifecycle
    // -----------------------------------------------------------------------

    /// Stops any active strategy, constructs the requested one, and
    /// starts it.
    pub async fn set_strategy(self: &Arc<Self>, kind: IndexingStrategyKind) -> Result<()> {
        let mut slot = self.strategy.acquire().await;
        if let Some(current) = slot.as_mut() {
            current.stop().await;
        }
        let mut strategy = Strategy::build(kind, self.manager.clone(), self.integrity.clone());
        strategy.initialize().await?;
        strategy.start().await?;
        *slot = Some(strategy);
        Ok(())
    }

    /// Applies pending strategy work so a following read observes it.
    pub async fn flush(&self) -> Result<()> {
        let slot = self.strategy.acquire().await;
        match slot.as_ref() {
            Some(strategy) => strategy.flush().await,
            None => Ok(()),
        }
    }

    pub async fn strategy_stats(&self) -> Option<StrategyStats> {
        self.strategy.acquire().await.as_ref().map(|s| s.stats())
    }

    /// Feeds an event into the active strategy, as if the watcher had
    /// observed it. Lets transports forward editor-side notifications
    /// without waiting on filesystem latency.
    pub async fn notify_file_event(&self, event: crate::strategy::FileEvent) {
        let slot = self.strategy.acquire().await;
        if let Some(strategy) = slot.as_ref() {
            strategy.on_file_event(event).await;
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn staleness_warning(&self) -> Option<String> {
        match self.manager.metadata().indexing.state {
            IndexingState::InProgress => Some(
                "index build in progress; results may be incomplete".to_string(),
            ),
            IndexingState::Failed => Some(
                "last index build failed; results may be stale until reindex".to_string(),
            ),
            IndexingState::Complete => None,
        }
    }

    async fn run_search(
        &self,
        params: &SearchParams,
        purpose: EmbedPurpose,
        default_mode: SearchMode,
    ) -> Result<SearchResponse> {
        let start = std::time::Instant::now();
        self.flush().await?;

        // A failed build means the stores may hold a partial state;
        // repair before reading. An in-progress build only warns, the
        // results are best-effort by design.
        if self.manager.metadata().indexing.state == IndexingState::Failed {
            match self.integrity.reconcile().await {
                Ok(_) => self.manager.set_state_complete(),
                Err(e) => warn!("pre-search reconcile failed: {e}"),
            }
        }

        let hybrid = &self.manager.config().hybrid_search;
        let mode = match params.mode.as_deref() {
            None => default_mode,
            some => search::validate_search_mode(some),
        };
        let request = SearchRequest {
            query: params.query.clone(),
            mode,
            alpha: search::validate_alpha(params.alpha, hybrid.default_alpha),
            top_k: params.top_k.unwrap_or(10),
            rrf_k: hybrid.rrf_k,
            purpose,
        };

        let (store, fts) = match purpose {
            EmbedPurpose::Code => {
                let set = self.manager.code_store();
                (set, set.fts.as_deref())
            }
            EmbedPurpose::Docs => {
                let set = self.manager.docs_store().ok_or_else(|| {
                    Error::DocsIndexNotFound(self.project_root.to_string_lossy().to_string())
                })?;
                (set, set.fts.as_deref())
            }
        };

        let SearchOutcome { mut hits, effective_mode } =
            search::execute(&store.vectors, fts, self.manager.embedder(), &request).await?;

        if params.compact.unwrap_or(false) {
            for hit in &mut hits {
                if hit.text.chars().count() > COMPACT_TEXT_CHARS {
                    let truncated: String = hit.text.chars().take(COMPACT_TEXT_CHARS).collect();
                    hit.text = format!("{}…", truncated.trim_end());
                }
            }
        }

        Ok(SearchResponse {
            query: request.query,
            total_results: hits.len(),
            results: hits,
            search_time_ms: start.elapsed().as_millis() as u64,
            search_mode: effective_mode.as_str(),
            warning: self.staleness_warning(),
        })
    }

    pub async fn search_code(&self, params: SearchParams) -> Result<SearchResponse> {
        self.run_search(&params, EmbedPurpose::Code, SearchMode::Hybrid).await
    }

    /// Documentation search; vector by default, hybrid on request (which
    /// falls back to vector while docs carry no keyword index).
    pub async fn search_docs(&self, params: SearchParams) -> Result<SearchResponse> {
        self.run_search(&params, EmbedPurpose::Docs, SearchMode::Vector).await
    }

    pub async fn search_by_path(&self, pattern: &str, limit: usize) -> Result<serde_json::Value> {
        self.flush().await?;
        let mut matches = self
            .manager
            .code_store()
            .vectors
            .search_by_path(pattern, limit)
            .await?;
        if let Some(docs) = self.manager.docs_store() {
            let remaining = limit.saturating_sub(matches.len());
            if remaining > 0 {
                matches.extend(docs.vectors.search_by_path(pattern, remaining).await?);
            }
        }
        Ok(json!({
            "matches": matches,
            "pattern": pattern,
            "total_matches": matches.len(),
        }))
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        let metadata = self.manager.metadata();
        let counts = self.manager.counts().await;
        let hybrid = &self.manager.config().hybrid_search;
        let device: DeviceInfo = self.manager.embedder().device_info();
        let strategy = self.strategy_stats().await;

        let mut warnings: Vec<String> = Vec::new();
        if let Some(warning) = self.staleness_warning() {
            warnings.push(warning);
        }
        if counts.failed_embeddings > 0 {
            warnings.push(format!(
                "{} chunks could not be embedded and are missing from vector search",
                counts.failed_embeddings
            ));
        }

        Ok(json!({
            "status": metadata.indexing.state,
            "paths": {
                "project_path": self.project_root,
                "index_path": self.index_dir,
            },
            "counts": {
                "files": counts.code_files,
                "chunks": counts.code_chunks,
                "docs_files": counts.docs_files,
                "docs_chunks": counts.docs_chunks,
                "storage_bytes": counts.storage_bytes,
            },
            "model": {
                "id": metadata.model,
                "dimension": metadata.dimension,
                "docs_id": metadata.docs_model,
                "docs_dimension": metadata.docs_dimension,
            },
            "hybrid_search": {
                "enabled": hybrid.enabled,
                "fts_engine": counts.fts_engine,
                "fts_chunks": counts.fts_chunks,
                "default_alpha": hybrid.default_alpha,
            },
            "compute": device,
            "strategy": strategy,
            "indexing": metadata.indexing,
            "warnings": if warnings.is_empty() { serde_json::Value::Null } else { json!(warnings) },
        }))
    }

    pub fn config_payload(&self) -> serde_json::Value {
        let config_path = self.index_dir.join(layout::CONFIG);
        let exists = config_path.exists();
        json!({
            "exists": exists,
            "config_path": config_path,
            "index_path": self.index_dir,
            "config": if exists { json!(self.manager.config()) } else { serde_json::Value::Null },
            "message": if exists {
                "configuration loaded from the index directory"
            } else {
                "no configuration stored; defaults are in effect"
            },
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Full rebuild. The active strategy keeps running; its incremental
    /// updates serialize against the build through the store locks.
    pub async fn reindex_project(&self) -> Result<IndexStats> {
        self.manager.full_index(true).await
    }

    pub async fn reindex_file(&self, file_path: &str) -> Result<usize> {
        self.manager.update_file(file_path).await
    }

    pub async fn check_drift(&self) -> Result<DriftReport> {
        self.integrity.check_drift().await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.integrity.reconcile().await
    }

    /// Stops the strategy, closes every store, and deletes the index
    /// directory. The orchestrator must not be used afterwards.
    pub async fn delete_index(&self) -> Result<()> {
        {
            let mut slot = self.strategy.acquire().await;
            if let Some(strategy) = slot.as_mut() {
                strategy.stop().await;
            }
            *slot = None;
        }
        self.unregister_cleanup();
        self.manager.request_shutdown();
        if let Err(e) = self.manager.close().await {
            warn!("store close during delete: {e}");
        }
        std::fs::remove_dir_all(&self.index_dir)?;
        info!(path = %self.index_dir.display(), "index deleted");
        Ok(())
    }

    fn unregister_cleanup(&self) {
        if let Some(token) = self.cleanup_token.lock().take() {
            cleanup_registry().unregister(token);
        }
    }

    /// Graceful shutdown: stop the strategy (final lazy flush included),
    /// persist everything, release store handles.
    pub async fn shutdown(&self) {
        {
            let mut slot = self.strategy.acquire().await;
            if let Some(strategy) = slot.as_mut() {
                strategy.stop().await;
            }
            *slot = None;
        }
        self.unregister_cleanup();
        self.manager.request_shutdown();
        if let Err(e) = self.manager.close().await {
            warn!("shutdown close failed: {e}");
        }
        info!("orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FtsEngineKind;
    use crate::embedder::HashEmbedder;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.hybrid_search.fts_engine = FtsEngineKind::Portable;
        config
    }

    fn seed(project: &Path) {
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(
            project.join("src/token.rs"),
            "fn verify_session_token(token: &str) -> bool {\n    !token.is_empty()\n}\n",
        )
        .unwrap();
        std::fs::write(
            project.join("src/db.rs"),
            "fn open_database(url: &str) -> u32 {\n    url.len() as u32\n}\n",
        )
        .unwrap();
        std::fs::write(project.join("README.md"), "# Demo\n\nHow to verify tokens.\n").unwrap();
    }

    /// Scopes the storage root to a temp dir for the duration of a test.
    struct StorageRootGuard {
        _dir: tempfile::TempDir,
    }

    fn scoped_storage_root() -> StorageRootGuard {
        let dir = tempfile::TempDir::new().unwrap();
        // Safety: tests touching the storage root serialize through
        // test_build_serial, so no concurrent env mutation.
        unsafe { std::env::set_var("LODESTONE_DATA_DIR", dir.path()) };
        StorageRootGuard { _dir: dir }
    }

    #[tokio::test]
    async fn create_open_search_lifecycle() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let _root = scoped_storage_root();
        let project = tempfile::TempDir::new().unwrap();
        seed(project.path());

        let (orchestrator, stats) =
            Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
                .await
                .unwrap();
        assert_eq!(stats.files, 2);
        assert!(stats.chunks >= 2);

        // Second create on the same project is rejected.
        let err = Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INDEX_EXISTS");

        let response = orchestrator
            .search_code(SearchParams {
                query: "verify session token".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(response.total_results > 0);
        assert_eq!(response.search_mode, "hybrid");
        assert!(response.warning.is_none());
        assert_eq!(response.results[0].path, "src/token.rs");
        for hit in &response.results {
            assert!((0.0..=1.0).contains(&hit.score));
            assert!(hit.start_line <= hit.end_line);
            assert_eq!(hit.text.trim(), hit.text);
        }

        let docs = orchestrator
            .search_docs(SearchParams {
                query: "How to verify tokens.".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(docs.search_mode, "vector");
        assert!(docs.total_results > 0);

        let by_path = orchestrator.search_by_path("src/*.rs", 10).await.unwrap();
        assert_eq!(by_path["total_matches"], 2);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn open_requires_existing_index() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let _root = scoped_storage_root();
        let project = tempfile::TempDir::new().unwrap();
        seed(project.path());

        let err = Orchestrator::open(project.path(), Arc::new(HashEmbedder)).await.unwrap_err();
        assert_eq!(err.code(), "INDEX_NOT_FOUND");
    }

    #[tokio::test]
    async fn reopen_heals_offline_drift() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let _root = scoped_storage_root();
        let project = tempfile::TempDir::new().unwrap();
        seed(project.path());

        let (orchestrator, _) =
            Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
                .await
                .unwrap();
        orchestrator.shutdown().await;
        drop(orchestrator);

        // Change the world while the service is down.
        std::fs::remove_file(project.path().join("src/db.rs")).unwrap();
        std::fs::write(
            project.path().join("src/fresh.rs"),
            "fn created_while_down() {}\n",
        )
        .unwrap();
        std::fs::write(
            project.path().join("src/token.rs"),
            "fn verify_session_token_v2(token: &str) -> bool { token.len() > 2 }\n",
        )
        .unwrap();

        let orchestrator =
            Orchestrator::open(project.path(), Arc::new(HashEmbedder)).await.unwrap();
        let files = orchestrator.manager().code_store().vectors.indexed_files().await;
        assert!(files.contains(&"src/fresh.rs".to_string()));
        assert!(!files.contains(&"src/db.rs".to_string()));

        let drift = orchestrator.check_drift().await.unwrap();
        assert!(drift.in_sync);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn reindex_file_updates_stores() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let _root = scoped_storage_root();
        let project = tempfile::TempDir::new().unwrap();
        seed(project.path());

        let (orchestrator, _) =
            Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
                .await
                .unwrap();

        std::fs::write(
            project.path().join("src/token.rs"),
            "fn renamed_verifier(token: &str) -> bool { token.len() > 4 }\n",
        )
        .unwrap();
        let chunks = orchestrator.reindex_file("src/token.rs").await.unwrap();
        assert!(chunks > 0);

        let response = orchestrator
            .search_code(SearchParams {
                query: "renamed_verifier".to_string(),
                mode: Some("fts".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(response.results.iter().any(|h| h.path == "src/token.rs"));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn delete_index_removes_directory() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let _root = scoped_storage_root();
        let project = tempfile::TempDir::new().unwrap();
        seed(project.path());

        let (orchestrator, _) =
            Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
                .await
                .unwrap();
        let index_dir = orchestrator.index_dir().to_path_buf();
        assert!(index_dir.exists());

        orchestrator.delete_index().await.unwrap();
        assert!(!index_dir.exists());
    }

    #[tokio::test]
    async fn status_reports_counts_and_engine() {
        let _serial = crate::sync::test_build_serial().lock().await;
        let _root = scoped_storage_root();
        let project = tempfile::TempDir::new().unwrap();
        seed(project.path());

        let (orchestrator, _) =
            Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
                .await
                .unwrap();

        let status = orchestrator.status().await.unwrap();
        assert_eq!(status["status"], "complete");
        assert_eq!(status["counts"]["files"], 2);
        assert_eq!(status["hybrid_search"]["enabled"], true);
        assert_eq!(status["hybrid_search"]["fts_engine"], "portable");
        assert_eq!(status["compute"]["device"], "cpu");
        assert_eq!(status["strategy"]["kind"], "lazy");

        let config = orchestrator.config_payload();
        assert_eq!(config["exists"], true);
        orchestrator.shutdown().await;
    }
}
