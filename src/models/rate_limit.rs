//! Rate-limit actions and the rejection signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mutating operations gated by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAction {
    Connect,
    MoveAvatar,
    Heartbeat,
    JoinPoi,
    LeavePoi,
    CreatePoi,
    UpdatePoi,
    DeletePoi,
}

impl RateAction {
    pub const ALL: [RateAction; 8] = [
        RateAction::Connect,
        RateAction::MoveAvatar,
        RateAction::Heartbeat,
        RateAction::JoinPoi,
        RateAction::LeavePoi,
        RateAction::CreatePoi,
        RateAction::UpdatePoi,
        RateAction::DeletePoi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateAction::Connect => "connect",
            RateAction::MoveAvatar => "move_avatar",
            RateAction::Heartbeat => "heartbeat",
            RateAction::JoinPoi => "join_poi",
            RateAction::LeavePoi => "leave_poi",
            RateAction::CreatePoi => "create_poi",
            RateAction::UpdatePoi => "update_poi",
            RateAction::DeletePoi => "delete_poi",
        }
    }
}

impl fmt::Display for RateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection carrying what a caller needs for a "retry after N seconds" reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitExceeded {
    pub identity: String,
    pub action: RateAction,
    pub limit: u64,
    pub retry_after_secs: u64,
    pub reset_at: DateTime<Utc>,
}

/// Current standing of one `(identity, action)` window, for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}
