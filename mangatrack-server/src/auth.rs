//! Session extraction. The session/cookie machinery itself is an external
//! collaborator: an upstream auth layer authenticates the request and
//! forwards the subject as `x-authenticated-user`. Absence means 401 here.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use mangatrack_core::types::UserId;

use crate::errors::AppError;

#[derive(Clone, Copy, Debug)]
pub struct AuthenticatedUser(pub UserId);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-authenticated-user")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("authentication required"))?;
        let id = Uuid::parse_str(raw)
            .map_err(|_| AppError::unauthorized("authentication required"))?;
        Ok(AuthenticatedUser(UserId(id)))
    }
}
