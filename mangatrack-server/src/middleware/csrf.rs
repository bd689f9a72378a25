//! CSRF middleware: every mutating request must carry a same-origin (or
//! allow-listed) Origin or Referer.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use mangatrack_core::security::{validate_origin, OriginContext};
use mangatrack_core::types::AuditLogRecord;

use crate::errors::AppError;
use crate::state::AppState;

pub async fn require_same_origin(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let headers = request.headers();
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    let context = OriginContext {
        method: request.method().as_str(),
        origin: header("origin"),
        referer: header("referer"),
        host: header("host"),
        forwarded_host: header("x-forwarded-host"),
    };

    if let Err(reason) = validate_origin(&context, &state.csrf) {
        state
            .audit
            .record(AuditLogRecord {
                event: "csrf.rejected".to_string(),
                status: "denied".to_string(),
                user_id: None,
                ip: header("x-forwarded-for").map(str::to_owned),
                user_agent: header("user-agent").map(str::to_owned),
                metadata: serde_json::json!({
                    "path": request.uri().path(),
                    "reason": reason,
                }),
                created_at: Utc::now(),
            })
            .await;
        // No enumeration: the client learns it was forbidden, not why.
        return Err(AppError::forbidden("request rejected"));
    }

    Ok(next.run(request).await)
}
