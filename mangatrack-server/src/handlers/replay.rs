//! `POST /sync/replay`: the offline outbox replay endpoint.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use mangatrack_core::outbox::{ActionResult, OutboxAction};

use crate::auth::AuthenticatedUser;
use crate::errors::AppResult;
use crate::state::AppState;

/// Hard cap on actions per replay call; the body size limit catches most
/// abuse before this does.
const MAX_REPLAY_ACTIONS: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub actions: Vec<OutboxAction>,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub results: Vec<ActionResult>,
}

pub async fn replay(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<ReplayRequest>,
) -> AppResult<Json<ReplayResponse>> {
    if request.actions.len() > MAX_REPLAY_ACTIONS {
        return Err(crate::errors::AppError::validation(format!(
            "replay batch exceeds {MAX_REPLAY_ACTIONS} actions"
        )));
    }

    let results = state.reconciler.apply(user_id, request.actions).await;
    Ok(Json(ReplayResponse { results }))
}
