//! Durable session record mirrored into the presence store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::presence::{Position, SessionPresence};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub map_id: Uuid,
    pub position: Position,
    pub current_poi: Option<Uuid>,
    pub is_active: bool,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Presence view of this record. `current_poi` starts unset; the caller
    /// re-checks it against the membership registry.
    pub fn to_presence(&self) -> SessionPresence {
        SessionPresence {
            session_id: self.id,
            user_id: self.user_id,
            map_id: self.map_id,
            avatar_position: self.position,
            last_active: self.last_active,
            current_poi: None,
        }
    }
}

/// Input to the durable session create.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub map_id: Uuid,
    pub position: Position,
}
