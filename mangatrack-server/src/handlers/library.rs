//! Library maintenance endpoints: metadata retry and bulk import.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mangatrack_core::library::{validate_import, RawImportEntry, MAX_IMPORT_ENTRIES};
use mangatrack_core::queue::{
    EnqueueOptions, ImportJobPayload, JobId, JobPayload, JobPriority, JobState, QueueName,
};
use mangatrack_core::types::{EntryId, ImportJobId};

use crate::auth::AuthenticatedUser;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RetryMetadataResponse {
    pub status: &'static str,
}

pub async fn retry_metadata(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(entry_id): Path<Uuid>,
) -> AppResult<Json<RetryMetadataResponse>> {
    // Both outcomes are success to the caller: the entry will be resolved.
    state
        .metadata_retry
        .retry(user_id, EntryId(entry_id))
        .await?;
    Ok(Json(RetryMetadataResponse { status: "queued" }))
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub entries: Vec<RawImportEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    pub job_id: ImportJobId,
    pub accepted: usize,
}

pub async fn import_library(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<ImportRequest>,
) -> AppResult<Json<ImportResponse>> {
    if request.entries.len() > MAX_IMPORT_ENTRIES {
        return Err(AppError::validation(format!(
            "import exceeds {MAX_IMPORT_ENTRIES} entries"
        )));
    }
    let entries = validate_import(request.entries)?;
    if entries.is_empty() {
        return Err(AppError::validation("import contains no usable entries"));
    }

    let job_id = ImportJobId::new();
    let accepted = entries.len();
    state
        .queue
        .enqueue(
            JobId::import(job_id),
            JobPayload::Import(ImportJobPayload {
                job_id,
                user_id,
                entries,
            }),
            EnqueueOptions {
                priority: Some(JobPriority::P2),
                ..Default::default()
            },
        )
        .await?;

    Ok(Json(ImportResponse { job_id, accepted }))
}

#[derive(Debug, Deserialize)]
pub struct ImportStatusQuery {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ImportStatusResponse {
    pub id: Uuid,
    pub status: &'static str,
}

pub async fn import_status(
    State(state): State<AppState>,
    AuthenticatedUser(_user_id): AuthenticatedUser,
    Query(query): Query<ImportStatusQuery>,
) -> AppResult<Json<ImportStatusResponse>> {
    let state_label = match state
        .queue
        .find_state(QueueName::Import, &JobId::import(ImportJobId(query.id)))
        .await?
    {
        Some(JobState::Waiting) | Some(JobState::Delayed) => "queued",
        Some(JobState::Active) => "processing",
        Some(JobState::Failed) => "failed",
        Some(JobState::Completed) => "completed",
        // Completed imports are removed from the queue.
        None => "completed",
    };
    Ok(Json(ImportStatusResponse {
        id: query.id,
        status: state_label,
    }))
}
