use crate::handler::{AppState, ReloadRequest};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

/// GET /api/stats — engine counters plus current store sizes.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state.engine.load();
    let stats = engine.stats();
    let (static_entries, dynamic_entries) = match engine.stores().sizes() {
        Ok(sizes) => sizes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read store sizes");
            (0, 0)
        }
    };

    Json(serde_json::json!({
        "stats": stats,
        "stores": {
            "static": {
                "name": engine.stores().static_store(),
                "entries": static_entries,
            },
            "dynamic": {
                "name": engine.stores().dynamic_store(),
                "entries": dynamic_entries,
            },
        },
    }))
}

/// POST /api/lifecycle — force an install/activate of the current config.
/// The work runs on the reload task; this only schedules it.
pub async fn lifecycle_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.reload_tx.send(ReloadRequest::Reinstall) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "reinstall scheduled"})),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "reload task not running"})),
        ),
    }
}
