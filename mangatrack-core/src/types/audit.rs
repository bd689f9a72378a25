use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only login attempt row; 24h retention bounds the lockout scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub email: String,
    pub ip: String,
    pub success: bool,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogRecord {
    pub event: String,
    pub status: String,
    pub user_id: Option<Uuid>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Written exactly once per job, on its terminal failure (the DLQ semantic).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub queue_name: String,
    pub job_id: String,
    pub error_message: String,
    pub attempts_made: i32,
    pub payload: serde_json::Value,
}
