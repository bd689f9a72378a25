//! Best-effort audit logging. A failed audit write is logged and swallowed;
//! it never fails the operation being audited.

use std::fmt;

use sqlx::PgPool;
use tracing::warn;

use crate::types::AuditLogRecord;

#[derive(Clone)]
pub struct AuditLogger {
    pool: Option<PgPool>,
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("persistent", &self.pool.is_some())
            .finish()
    }
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Some(pool) }
    }

    /// Tracing-only logger for tests and tools.
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    pub async fn record(&self, record: AuditLogRecord) {
        tracing::info!(
            event = %record.event,
            status = %record.status,
            user = ?record.user_id,
            "audit"
        );
        let Some(pool) = &self.pool else {
            return;
        };
        let result = sqlx::query(
            r#"
            INSERT INTO audit_logs (event, status, user_id, ip, ua, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.event)
        .bind(&record.status)
        .bind(record.user_id)
        .bind(&record.ip)
        .bind(&record.user_agent)
        .bind(&record.metadata)
        .bind(record.created_at)
        .execute(pool)
        .await;
        if let Err(err) = result {
            warn!(event = %record.event, error = %err, "audit write failed");
        }
    }
}
