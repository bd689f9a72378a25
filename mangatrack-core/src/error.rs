use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Duration,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Whether a failed operation may succeed if repeated.
    ///
    /// Lock contention surfaces as `Conflict` and is retryable; auth and
    /// validation failures never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Redis(_) | Self::Internal(_) => true,
            Self::Conflict(_) => true,
            Self::RateLimited { .. } => true,
            Self::Database(err) => is_transient_db_error(err),
            Self::BadRequest(_)
            | Self::Unauthorized(_)
            | Self::Forbidden(_)
            | Self::NotFound(_)
            | Self::Validation(_)
            | Self::Serialization(_) => false,
        }
    }
}

/// Transient database errors: connection loss and serialization failures.
/// Postgres code 55P03 (lock_not_available) is handled separately because
/// callers translate it to `Conflict` before this check runs.
fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") | Some("57P01") | Some("08006") | Some("08001")
        ),
        _ => false,
    }
}

/// Translate a database error on a contended statement into the domain error.
///
/// `55P03` is raised by `FOR UPDATE NOWAIT` and `pg_try_advisory_xact_lock`
/// failures; unique violations (`23505`) mean a concurrent writer won.
pub fn map_contention(err: sqlx::Error, what: &str) -> CoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("55P03") => return CoreError::Conflict(format!("{what}: row is locked")),
            Some("23505") => return CoreError::Conflict(format!("{what}: unique violation")),
            // statement_timeout: the transaction blew its budget.
            Some("57014") => return CoreError::Timeout(format!("{what}: transaction budget exceeded")),
            _ => {}
        }
    }
    CoreError::Database(err)
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_timeout_are_retryable() {
        assert!(CoreError::Conflict("locked".into()).is_retryable());
        assert!(CoreError::Timeout("tx budget".into()).is_retryable());
        assert!(!CoreError::Unauthorized("no session".into()).is_retryable());
        assert!(!CoreError::Validation("bad payload".into()).is_retryable());
    }
}
