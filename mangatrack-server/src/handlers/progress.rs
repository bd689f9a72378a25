//! `PATCH /library/{entry_id}/progress`: the authenticated progress write.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mangatrack_core::progress::{ProgressCommand, ProgressOutcome};
use mangatrack_core::types::{EntryId, LibraryEntry};

use crate::auth::AuthenticatedUser;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Per-user write budget for the progress endpoint.
const PROGRESS_LIMIT: u32 = 60;
const PROGRESS_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    pub chapter_number: f64,
    #[serde(default)]
    pub source_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    #[serde(default)]
    pub read_time_seconds: Option<u32>,
    #[serde(default)]
    pub pages: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub entry: LibraryEntry,
    pub new_progress: bool,
    pub chapters_marked: u64,
    pub xp_delta: i64,
    pub xp_total: i64,
    pub level: u32,
    pub previous_level: u32,
    pub season: String,
    pub season_xp: i64,
}

impl From<ProgressOutcome> for ProgressResponse {
    fn from(outcome: ProgressOutcome) -> Self {
        Self {
            entry: outcome.entry,
            new_progress: outcome.new_progress,
            chapters_marked: outcome.chapters_marked,
            xp_delta: outcome.xp_delta,
            xp_total: outcome.xp_total,
            level: outcome.level,
            previous_level: outcome.previous_level,
            season: outcome.season,
            season_xp: outcome.season_xp,
        }
    }
}

pub async fn update_progress(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(entry_id): Path<Uuid>,
    Json(request): Json<ProgressRequest>,
) -> AppResult<Json<ProgressResponse>> {
    let decision = state
        .limiter
        .check(
            &format!("progress:{user_id}"),
            PROGRESS_LIMIT,
            PROGRESS_WINDOW,
        )
        .await;
    if !decision.allowed {
        return Err(AppError::rate_limited(
            "too many progress updates",
            decision.reset_after().as_secs().max(1),
        ));
    }

    let outcome = state
        .progress
        .mark_progress(ProgressCommand {
            user_id,
            entry_id: EntryId(entry_id),
            chapter_number: request.chapter_number,
            updated_at: request.timestamp,
            device_id: Some(request.device_id),
            read_time_seconds: request.read_time_seconds,
            pages: request.pages,
        })
        .await?;

    Ok(Json(ProgressResponse::from(outcome)))
}
