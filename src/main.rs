use clap::Parser;
use lodestone::{cli, config, error, sync};
use std::process::ExitCode;
use tracing_subscriber::prelude::*;

fn init_tracing(project_root: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    // Logs live under the project's index directory once it exists,
    // falling back to the storage root before the first build.
    let project_root =
        dunce::canonicalize(project_root).unwrap_or_else(|_| project_root.to_path_buf());
    let index_dir = config::index_dir_for(&config::storage_root(), &project_root);
    let log_dir = if index_dir.exists() {
        index_dir.join(config::layout::LOGS_DIR)
    } else {
        config::storage_root().join(config::layout::LOGS_DIR)
    };
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "lodestone.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "lodestone=info,tower_http=info".into());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

fn install_panic_hook() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        tracing::error!(target: "lodestone::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));
}

fn bootstrap_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    use anyhow::Context;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    let _log_guard = init_tracing(&cli.project_root());
    install_panic_hook();

    let runtime = match bootstrap_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Catch a panic unwinding out of the primary future so the cleanup
    // registry still gets its one graceful pass before the process
    // exits non-zero. The hook above has already logged the panic.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        runtime.block_on(cli::run(cli))
    }));

    // One graceful pass even on the error and panic paths, so partial
    // state is flushed and temp files are cleaned up.
    runtime.block_on(sync::cleanup_registry().run_cleanup(std::time::Duration::from_secs(5)));

    match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            let body = e.to_json(error::debug_mode());
            eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_else(|_| e.to_string()));
            ExitCode::FAILURE
        }
        Err(_) => ExitCode::FAILURE,
    }
}
