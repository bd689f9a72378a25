use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, patch, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers::{library, progress, replay, stats};
use crate::middleware::require_same_origin;
use crate::state::AppState;

/// Request bodies are capped at 1 MB; the import and replay payload caps
/// sit behind this.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/sync/replay", post(replay::replay))
        .route("/library/{entry_id}/progress", patch(progress::update_progress))
        .route(
            "/library/{entry_id}/retry-metadata",
            post(library::retry_metadata),
        )
        .route(
            "/library/import",
            post(library::import_library).get(library::import_status),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_same_origin,
        ));

    Router::new()
        .merge(api)
        .route("/internal/queue-stats", get(stats::queue_stats))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
