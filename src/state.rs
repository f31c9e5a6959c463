use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;

/// Engine progress events, broadcast to whoever listens (the CLI index
/// command renders them; transports may forward them).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    #[serde(rename = "index_started")]
    IndexingStarted { expected_files: usize },
    #[serde(rename = "index_progress")]
    IndexingProgress { processed_files: usize, expected_files: usize },
    #[serde(rename = "index_complete")]
    IndexingCompleted { files: usize, chunks: usize, duration_ms: u64 },
    #[serde(rename = "index_failed")]
    IndexingFailed { error: String },
    #[serde(rename = "file_indexed")]
    FileIndexed { path: String, chunks: usize },
    #[serde(rename = "file_removed")]
    FileRemoved { path: String },
}

/// Shared state handed to the RPC router. The orchestrator slot is
/// empty until an index exists; `create_index` fills it and
/// `delete_index` clears it.
#[derive(Clone)]
pub struct AppState {
    pub project_root: PathBuf,
    pub embedder: Arc<dyn Embedder>,
    orchestrator: Arc<tokio::sync::RwLock<Option<Arc<Orchestrator>>>>,
}

impl AppState {
    pub fn new(
        project_root: PathBuf,
        embedder: Arc<dyn Embedder>,
        orchestrator: Option<Arc<Orchestrator>>,
    ) -> Self {
        Self {
            project_root,
            embedder,
            orchestrator: Arc::new(tokio::sync::RwLock::new(orchestrator)),
        }
    }

    /// The open orchestrator, or `INDEX_NOT_FOUND` before any index
    /// exists for the served project.
    pub async fn orchestrator(&self) -> Result<Arc<Orchestrator>> {
        self.orchestrator.read().await.clone().ok_or_else(|| {
            Error::IndexNotFound(self.project_root.to_string_lossy().to_string())
        })
    }

    pub async fn install_orchestrator(&self, orchestrator: Arc<Orchestrator>) {
        *self.orchestrator.write().await = Some(orchestrator);
    }

    pub async fn take_orchestrator(&self) -> Option<Arc<Orchestrator>> {
        self.orchestrator.write().await.take()
    }

    /// Write guard for create: holds the slot exclusively so two
    /// concurrent creates cannot both build.
    pub async fn slot(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, Option<Arc<Orchestrator>>> {
        self.orchestrator.write().await
    }
}
