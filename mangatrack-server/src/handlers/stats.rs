//! `GET /internal/queue-stats`: operator observability, guarded by the
//! internal API secret.

use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;

use mangatrack_core::gatekeeper::QueueZone;
use mangatrack_core::queue::{JobCounts, QueueName, ALL_QUEUES};
use mangatrack_core::security::{auth_circuit, CircuitStats};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub queue: &'static str,
    #[serde(flatten)]
    pub counts: JobCounts,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queues: Vec<QueueStats>,
    pub sync_zone: QueueZone,
    pub circuit: CircuitStats,
    pub recent_failures: usize,
}

pub async fn queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<StatsResponse>> {
    let Some(secret) = state.settings.internal_api_secret.as_deref() else {
        return Err(AppError::not_found("not found"));
    };
    let presented = headers
        .get("x-internal-secret")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented != secret {
        return Err(AppError::forbidden("request rejected"));
    }

    let mut queues = Vec::with_capacity(ALL_QUEUES.len());
    let mut sync_depth = 0u64;
    for queue in ALL_QUEUES {
        let counts = state.queue.counts(queue).await?;
        if queue == QueueName::SyncSource {
            sync_depth = counts.total_queued();
        }
        queues.push(QueueStats {
            queue: queue.as_str(),
            counts,
        });
    }

    let failures = state.queue.recent_failures(50).await?;
    Ok(Json(StatsResponse {
        queues,
        sync_zone: QueueZone::from_depth(sync_depth),
        circuit: auth_circuit().stats(),
        recent_failures: failures.len(),
    }))
}
