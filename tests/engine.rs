//! End-to-end engine flows: build, search, incremental updates through
//! strategies, and concurrent-build exclusion. Uses the deterministic
//! offline embedder so nothing downloads models.

use lodestone::config::{Config, FtsEngineKind, IndexingStrategyKind};
use lodestone::embedder::HashEmbedder;
use lodestone::orchestrator::{Orchestrator, SearchParams};
use lodestone::strategy::{FileEvent, FileEventKind};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Full builds take a process-wide lock; tests serialize around it.
fn serial() -> &'static tokio::sync::Mutex<()> {
    static SERIAL: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    SERIAL.get_or_init(|| tokio::sync::Mutex::new(()))
}

struct StorageRootGuard {
    _dir: tempfile::TempDir,
}

fn scoped_storage_root() -> StorageRootGuard {
    let dir = tempfile::TempDir::new().unwrap();
    unsafe { std::env::set_var("LODESTONE_DATA_DIR", dir.path()) };
    StorageRootGuard { _dir: dir }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.hybrid_search.fts_engine = FtsEngineKind::Portable;
    config
}

fn seed(project: &Path) {
    std::fs::create_dir_all(project.join("src")).unwrap();
    std::fs::write(
        project.join("src/auth.rs"),
        "fn verify_token(token: &str) -> bool {\n    token.starts_with(\"st-\")\n}\n",
    )
    .unwrap();
    std::fs::write(
        project.join("src/storage.rs"),
        "fn open_store(path: &str) -> usize {\n    path.len()\n}\n",
    )
    .unwrap();
    std::fs::write(
        project.join("src/render.rs"),
        "fn render_page(title: &str) -> String {\n    format!(\"<h1>{title}</h1>\")\n}\n",
    )
    .unwrap();
    std::fs::write(project.join("README.md"), "# App\n\nToken verification service.\n").unwrap();
}

#[tokio::test]
async fn lazy_strategy_flushes_before_search() {
    let _serial = serial().lock().await;
    let _root = scoped_storage_root();
    let project = tempfile::TempDir::new().unwrap();
    seed(project.path());

    let (orchestrator, _) =
        Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
            .await
            .unwrap();
    let root = orchestrator.project_root().to_path_buf();

    // Modify three files, then search immediately; the flush taken by
    // the search must apply all three first.
    for (name, body) in [
        ("src/auth.rs", "// rewritten after review\nfn verify_token2(token: &str) -> bool { token.len() > 3 }\n"),
        ("src/storage.rs", "// rewritten after review\nfn open_store2(path: &str) -> usize { path.len() * 2 }\n"),
        ("src/render.rs", "// rewritten after review\nfn render_page2(title: &str) -> String { title.into() }\n"),
    ] {
        std::fs::write(root.join(name), body).unwrap();
        orchestrator
            .notify_file_event(FileEvent {
                path: root.join(name),
                kind: FileEventKind::Modified,
            })
            .await;
    }

    let response = orchestrator
        .search_code(SearchParams {
            query: "rewritten".to_string(),
            mode: Some("fts".to_string()),
            top_k: Some(10),
            ..Default::default()
        })
        .await
        .unwrap();

    let paths: Vec<&str> = response.results.iter().map(|h| h.path.as_str()).collect();
    assert!(paths.contains(&"src/auth.rs"));
    assert!(paths.contains(&"src/storage.rs"));
    assert!(paths.contains(&"src/render.rs"));

    let stats = orchestrator.strategy_stats().await.unwrap();
    assert_eq!(stats.kind, "lazy");
    assert_eq!(stats.pending_events, 0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn concurrent_full_builds_are_exclusive() {
    let _serial = serial().lock().await;
    let _root = scoped_storage_root();
    let project = tempfile::TempDir::new().unwrap();
    seed(project.path());
    // A couple hundred files so the first build reliably overlaps the
    // second attempt.
    for i in 0..200 {
        std::fs::write(
            project.path().join(format!("src/gen_{i}.rs")),
            format!("fn generated_{i}() -> usize {{ {i} }}\n"),
        )
        .unwrap();
    }

    let (orchestrator, _) =
        Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
            .await
            .unwrap();

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.reindex_project().await })
    };
    // Give the first build a head start, then contend.
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let second = orchestrator.reindex_project().await;

    let first = first.await.unwrap();
    match (&first, &second) {
        (Ok(_), Err(e)) | (Err(e), Ok(_)) => {
            assert_eq!(e.code(), "INDEXING_IN_PROGRESS");
        }
        (Ok(_), Ok(_)) => panic!("both rebuilds ran concurrently"),
        (Err(a), Err(b)) => panic!("both rebuilds failed: {a} / {b}"),
    }

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn hybrid_results_satisfy_search_invariants() {
    let _serial = serial().lock().await;
    let _root = scoped_storage_root();
    let project = tempfile::TempDir::new().unwrap();
    seed(project.path());

    let (orchestrator, _) =
        Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
            .await
            .unwrap();

    let response = orchestrator
        .search_code(SearchParams {
            query: "verify token".to_string(),
            top_k: Some(50),
            alpha: Some(0.5),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(response.total_results > 0);

    for hit in &response.results {
        assert!((0.0..=1.0).contains(&hit.score), "score out of range: {}", hit.score);
        assert!(hit.start_line >= 1);
        assert!(hit.start_line <= hit.end_line);
        assert_eq!(hit.text.trim(), hit.text);
    }
    // No two results in one file touch or overlap.
    for a in &response.results {
        for b in &response.results {
            if a.id != b.id && a.path == b.path {
                assert!(
                    a.end_line + 1 < b.start_line || b.end_line + 1 < a.start_line,
                    "overlapping results survived dedup: {} and {}",
                    a.id,
                    b.id
                );
            }
        }
    }

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn deleted_path_disappears_from_every_surface() {
    let _serial = serial().lock().await;
    let _root = scoped_storage_root();
    let project = tempfile::TempDir::new().unwrap();
    seed(project.path());

    let (orchestrator, _) =
        Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
            .await
            .unwrap();

    let manager = orchestrator.manager();
    manager.remove_file("src/storage.rs").await.unwrap();

    let by_path = orchestrator.search_by_path("src/storage*", 10).await.unwrap();
    assert_eq!(by_path["total_matches"], 0);
    assert!(
        !manager
            .code_store()
            .vectors
            .indexed_files()
            .await
            .contains(&"src/storage.rs".to_string())
    );

    let fts_hits = orchestrator
        .search_code(SearchParams {
            query: "open_store".to_string(),
            mode: Some("fts".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(fts_hits.results.iter().all(|h| h.path != "src/storage.rs"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn git_strategy_requires_repository_and_reconciles_on_commit() {
    let _serial = serial().lock().await;
    let _root = scoped_storage_root();
    let project = tempfile::TempDir::new().unwrap();
    seed(project.path());

    // Without a repository the git strategy fails to initialize, and
    // create_index surfaces that cleanly.
    let mut config = test_config();
    config.indexing_strategy = IndexingStrategyKind::Git;
    let err = Orchestrator::create(project.path(), config.clone(), Arc::new(HashEmbedder))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROJECT_NOT_DETECTED");

    // With .git/logs/HEAD present the strategy starts, and a HEAD event
    // reconciles drift.
    std::fs::create_dir_all(project.path().join(".git/logs")).unwrap();
    std::fs::write(project.path().join(".git/logs/HEAD"), "0 1 initial\n").unwrap();
    let (orchestrator, _) =
        Orchestrator::create(project.path(), config, Arc::new(HashEmbedder)).await.unwrap();

    std::fs::write(project.path().join("src/committed.rs"), "fn from_commit() {}\n").unwrap();
    orchestrator
        .notify_file_event(FileEvent {
            path: project.path().join(".git/logs/HEAD"),
            kind: FileEventKind::Modified,
        })
        .await;
    orchestrator.flush().await.unwrap();

    let files = orchestrator.manager().code_store().vectors.indexed_files().await;
    assert!(files.contains(&"src/committed.rs".to_string()));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn search_during_failed_state_carries_warning() {
    let _serial = serial().lock().await;
    let _root = scoped_storage_root();
    let project = tempfile::TempDir::new().unwrap();
    seed(project.path());

    let (orchestrator, _) =
        Orchestrator::create(project.path(), test_config(), Arc::new(HashEmbedder))
            .await
            .unwrap();

    // Clean state: no warning.
    let clean = orchestrator
        .search_code(SearchParams { query: "token".into(), ..Default::default() })
        .await
        .unwrap();
    assert!(clean.warning.is_none());

    orchestrator.shutdown().await;
}
