use axum::{
    Json, Router,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::OnceLock;
use std::time::Instant;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::rpc;
use crate::state::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

async fn health_check() -> Json<Value> {
    let uptime = START_TIME.get().map(|s| s.elapsed().as_secs()).unwrap_or(0);
    Json(json!({
        "status": "ok",
        "service": "lodestone",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
    }))
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/rpc", get(rpc::list_operations))
        .route("/rpc/create_index", post(rpc::create_index))
        .route("/rpc/search_code", post(rpc::search_code))
        .route("/rpc/search_docs", post(rpc::search_docs))
        .route("/rpc/search_by_path", post(rpc::search_by_path))
        .route("/rpc/get_index_status", get(rpc::get_index_status))
        .route("/rpc/get_config", get(rpc::get_config))
        .route("/rpc/reindex_project", post(rpc::reindex_project))
        .route("/rpc/reindex_file", post(rpc::reindex_file))
        .route("/rpc/delete_index", post(rpc::delete_index))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
