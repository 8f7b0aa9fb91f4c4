//! Caller identity. Verifying it is the job of whatever sits in front of this
//! service; here we only read it.

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;

pub const HEADER_USER_ID: &str = "x-user-id";

/// The calling user, from the `x-user-id` header or, for WebSocket upgrades
/// where browsers cannot set headers, the `user_id` query parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIdentity(pub Uuid);

#[derive(Deserialize)]
struct IdentityQuery {
    user_id: Option<String>,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = match parts.headers.get(HEADER_USER_ID) {
            Some(v) => v.to_str().ok().map(str::to_string),
            None => Query::<IdentityQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(q)| q.user_id),
        };
        let raw = raw.ok_or_else(|| AppError::Auth("missing x-user-id".to_string()))?;
        let user_id = Uuid::parse_str(raw.trim())
            .map_err(|_| AppError::Auth("x-user-id must be a UUID".to_string()))?;
        Ok(ClientIdentity(user_id))
    }
}
