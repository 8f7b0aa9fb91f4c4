//! Application error types and their HTTP rendering.

use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{RateLimitExceeded, RateLimitStatus};

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation timed out: {operation}")]
    StoreTimeout { operation: &'static str },

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("POI {poi_id} is full ({max} participants)")]
    AtCapacity { poi_id: Uuid, max: u64 },

    #[error("Rate limit exceeded for {}: retry after {}s", .0.action, .0.retry_after_secs)]
    RateLimited(RateLimitExceeded),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Store or database I/O that may succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            AppError::StoreTimeout { .. } => true,
            AppError::Db(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// "Already gone": callers usually treat this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            AppError::StoreTimeout { .. } => true,
            AppError::Redis(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl AppError {
    /// Machine-readable code for response bodies and WebSocket error frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AtCapacity { .. } => "at_capacity",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) | AppError::Serialization(_) => "validation_failed",
            AppError::Auth(_) => "unauthorized",
            AppError::RateLimited(_) => "rate_limited",
            AppError::Redis(_) | AppError::StoreTimeout { .. } | AppError::Db(_) => {
                "store_unavailable"
            }
            AppError::Internal(_) => "internal",
        }
    }

    /// What the end user is told. Never includes keys or backend detail.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Internal(_) => "Internal error".to_string(),
            AppError::Redis(_) | AppError::StoreTimeout { .. } | AppError::Db(_) => {
                "Service temporarily unavailable, please try again shortly".to_string()
            }
            AppError::Serialization(e) => format!("Invalid payload: {}", e),
            AppError::Validation(msg)
            | AppError::Auth(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg) => msg.clone(),
            AppError::AtCapacity { max, .. } => {
                format!("POI is full ({} participants max)", max)
            }
            AppError::RateLimited(rl) => format!(
                "Too many {} requests, retry after {} seconds",
                rl.action, rl.retry_after_secs
            ),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Redis(_) | AppError::StoreTimeout { .. } | AppError::Db(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Serialization(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::AtCapacity { .. } => StatusCode::CONFLICT,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Internal(_) => {
                tracing::error!(error = %self, "internal failure");
            }
            AppError::Redis(_) | AppError::StoreTimeout { .. } | AppError::Db(_) => {
                tracing::error!(error = %self, "backing store unavailable");
            }
            _ => {}
        }

        let body = Json(json!({ "error": self.client_message(), "code": self.code() }));
        if let AppError::RateLimited(rl) = &self {
            let mut headers = rate_limit_headers(&RateLimitStatus {
                limit: rl.limit,
                remaining: 0,
                reset_at: rl.reset_at,
            });
            headers.insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(rl.retry_after_secs),
            );
            return (self.status(), headers, body).into_response();
        }
        (self.status(), body).into_response()
    }
}

/// `x-ratelimit-*` headers for client-side backoff.
pub fn rate_limit_headers(status: &RateLimitStatus) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(status.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(status.remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(status.reset_at.timestamp().max(0)),
    );
    headers
}

pub type AppResult<T> = Result<T, AppError>;
