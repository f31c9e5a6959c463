//! Command-line surface sharing the engine with the RPC server. Exit
//! code 0 on success, 1 on any error; `DEBUG` in the environment adds
//! developer detail to error output.

use crate::config::{Config, FtsEngineKind, IndexingStrategyKind};
use crate::embedder::{Embedder, FastembedEmbedder, HashEmbedder};
use crate::error::Result;
use crate::orchestrator::{Orchestrator, SearchParams};
use crate::state::{AppState, EngineEvent};
use crate::sync::cleanup_registry;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "lodestone", version, about = "Local-first semantic code search")]
pub struct Cli {
    /// Project root; defaults to the current directory.
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    /// Use the deterministic offline embedder (no model download).
    /// Intended for smoke tests; search quality is keyword-exact only.
    #[arg(long, global = true, hide = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the RPC server for the project's index.
    Serve {
        #[arg(long, default_value = "127.0.0.1:9463")]
        addr: String,
    },
    /// Build the index for the project.
    Index {
        /// Update-triggering policy recorded in the index config.
        #[arg(long, value_enum)]
        strategy: Option<CliStrategy>,
        /// Keyword engine selection.
        #[arg(long, value_enum)]
        fts_engine: Option<CliFtsEngine>,
        /// Skip the documentation pipeline.
        #[arg(long)]
        no_docs: bool,
    },
    /// Search indexed code.
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        /// vector | fts | hybrid
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        compact: bool,
    },
    /// Search indexed documentation.
    SearchDocs {
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        alpha: Option<f64>,
    },
    /// List indexed files matching a glob pattern.
    Find {
        pattern: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show index status and counts.
    Status,
    /// Show the effective configuration.
    Config,
    /// Rebuild the whole index.
    Reindex,
    /// Re-index a single file.
    ReindexFile { file_path: String },
    /// Delete the project's index.
    Delete {
        /// Skip the confirmation requirement.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum CliStrategy {
    Realtime,
    Lazy,
    Git,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum CliFtsEngine {
    Auto,
    Portable,
    Native,
}

impl Cli {
    pub fn project_root(&self) -> PathBuf {
        self.project.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        if self.offline {
            Arc::new(HashEmbedder)
        } else {
            Arc::new(FastembedEmbedder::new())
        }
    }
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("output serialization failed: {e}"),
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let root = cli.project_root();
    let embedder = cli.embedder();

    match &cli.command {
        Command::Serve { addr } => serve(&root, embedder, addr).await,

        Command::Index { strategy, fts_engine, no_docs } => {
            let mut config = Config::default();
            if let Some(strategy) = strategy {
                config.indexing_strategy = match strategy {
                    CliStrategy::Realtime => IndexingStrategyKind::Realtime,
                    CliStrategy::Lazy => IndexingStrategyKind::Lazy,
                    CliStrategy::Git => IndexingStrategyKind::Git,
                };
            }
            if let Some(engine) = fts_engine {
                config.hybrid_search.fts_engine = match engine {
                    CliFtsEngine::Auto => FtsEngineKind::Auto,
                    CliFtsEngine::Portable => FtsEngineKind::Portable,
                    CliFtsEngine::Native => FtsEngineKind::Native,
                };
            }
            if *no_docs {
                config.index_docs = false;
            }

            let (orchestrator, stats) = Orchestrator::create(&root, config, embedder).await?;
            print_json(&serde_json::json!({
                "status": "complete",
                "project_path": orchestrator.project_root(),
                "index_path": orchestrator.index_dir(),
                "stats": {
                    "files": stats.files,
                    "chunks": stats.chunks,
                    "duration_ms": stats.duration_ms,
                    "error_count": stats.error_count,
                },
                "docs_stats": stats.docs,
                "errors": stats.errors,
            }));
            orchestrator.shutdown().await;
            Ok(())
        }

        Command::Search { query, top_k, mode, alpha, compact } => {
            let orchestrator = Orchestrator::open(&root, embedder).await?;
            let response = orchestrator
                .search_code(SearchParams {
                    query: query.clone(),
                    top_k: Some(*top_k),
                    mode: mode.clone(),
                    alpha: *alpha,
                    compact: Some(*compact),
                })
                .await?;
            print_json(&response);
            orchestrator.shutdown().await;
            Ok(())
        }

        Command::SearchDocs { query, top_k, mode, alpha } => {
            let orchestrator = Orchestrator::open(&root, embedder).await?;
            let response = orchestrator
                .search_docs(SearchParams {
                    query: query.clone(),
                    top_k: Some(*top_k),
                    mode: mode.clone(),
                    alpha: *alpha,
                    compact: None,
                })
                .await?;
            print_json(&response);
            orchestrator.shutdown().await;
            Ok(())
        }

        Command::Find { pattern, limit } => {
            let orchestrator = Orchestrator::open(&root, embedder).await?;
            let matches = orchestrator.search_by_path(pattern, (*limit).clamp(1, 1000)).await?;
            print_json(&matches);
            orchestrator.shutdown().await;
            Ok(())
        }

        Command::Status => {
            let orchestrator = Orchestrator::open(&root, embedder).await?;
            print_json(&orchestrator.status().await?);
            orchestrator.shutdown().await;
            Ok(())
        }

        Command::Config => {
            let orchestrator = Orchestrator::open(&root, embedder).await?;
            print_json(&orchestrator.config_payload());
            orchestrator.shutdown().await;
            Ok(())
        }

        Command::Reindex => {
            let orchestrator = Orchestrator::open(&root, embedder).await?;
            let progress = spawn_progress_printer(orchestrator.subscribe());
            let stats = orchestrator.reindex_project().await?;
            progress.abort();
            print_json(&stats);
            orchestrator.shutdown().await;
            Ok(())
        }

        Command::ReindexFile { file_path } => {
            let orchestrator = Orchestrator::open(&root, embedder).await?;
            let chunks = orchestrator.reindex_file(file_path).await?;
            print_json(&serde_json::json!({
                "status": "ok",
                "file_path": file_path,
                "chunks_created": chunks,
            }));
            orchestrator.shutdown().await;
            Ok(())
        }

        Command::Delete { yes } => {
            if !yes {
                return Err(crate::error::Error::InvalidQuery(
                    "deleting an index requires confirmation; pass --yes".to_string(),
                ));
            }
            let orchestrator = Orchestrator::open(&root, embedder).await?;
            let index_path = orchestrator.index_dir().to_path_buf();
            orchestrator.delete_index().await?;
            print_json(&serde_json::json!({
                "status": "deleted",
                "project_path": root,
                "index_path": index_path,
            }));
            Ok(())
        }
    }
}

/// Renders engine progress events as log lines during long builds.
fn spawn_progress_printer(
    mut rx: tokio::sync::broadcast::Receiver<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                EngineEvent::IndexingProgress { processed_files, expected_files } => {
                    info!("indexed {processed_files}/{expected_files} files");
                }
                EngineEvent::IndexingCompleted { files, chunks, duration_ms } => {
                    info!("index complete: {files} files, {chunks} chunks in {duration_ms}ms");
                }
                EngineEvent::IndexingFailed { error } => {
                    tracing::error!("indexing failed: {error}");
                }
                _ => {}
            }
        }
    })
}

async fn serve(root: &std::path::Path, embedder: Arc<dyn Embedder>, addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| crate::error::Error::InvalidQuery(format!("bad listen address: {e}")))?;
    let root = crate::paths::canonicalize_project(root)?;

    // Serving without an index is fine; create_index over RPC fills the
    // slot later.
    let orchestrator = match Orchestrator::open(&root, embedder.clone()).await {
        Ok(orchestrator) => Some(orchestrator),
        Err(e) if e.code() == "INDEX_NOT_FOUND" => {
            info!("no index for {} yet; waiting for create_index", root.display());
            None
        }
        Err(e) => return Err(e),
    };

    let state = AppState::new(root, embedder, orchestrator);
    let app = crate::server::create_app(state.clone());
    crate::server::init_start_time();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("lodestone listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Transport is closed; persist everything and run the registry.
    if let Some(orchestrator) = state.take_orchestrator().await {
        orchestrator.shutdown().await;
    }
    cleanup_registry().run_cleanup(Duration::from_secs(5)).await;
    info!("lodestone shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. A second signal force-exits without
/// waiting for cleanup.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); }
        _ = terminate => { info!("received terminate signal, shutting down"); }
    }

    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::warn!("second signal received, forcing exit");
        std::process::exit(130);
    });
}
