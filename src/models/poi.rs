//! Points of interest: durable records, request payloads and join outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::presence::Position;

/// Minimum distance between two POIs on the same map.
pub const MIN_POI_SPACING_METERS: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiRecord {
    pub id: Uuid,
    pub map_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub position: Position,
    pub max_participants: u32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn validate_position(position: &Position) -> Result<(), ValidationError> {
    position.validate().map_err(|_| ValidationError::new("position_out_of_range"))
}

/// Names are stored trimmed, so one that is only whitespace would store empty.
fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::new("blank_name"));
    }
    Ok(())
}

/// Body of `POST /maps/:map_id/pois`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePoiRequest {
    #[validate(length(min = 1, max = 100), custom(function = "validate_name"))]
    pub name: String,
    #[validate(length(max = 500))]
    #[serde(default)]
    pub description: Option<String>,
    #[validate(custom(function = "validate_position"))]
    pub position: Position,
    #[validate(range(min = 1, max = 100))]
    pub max_participants: u32,
}

/// Body of `PATCH /pois/:poi_id`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct PoiUpdate {
    #[validate(length(min = 1, max = 100), custom(function = "validate_name"))]
    pub name: Option<String>,
    #[validate(length(max = 500))]
    pub description: Option<String>,
    #[validate(range(min = 1, max = 100))]
    pub max_participants: Option<u32>,
}

impl PoiUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.max_participants.is_none()
    }
}

/// Input to the durable create.
#[derive(Debug, Clone)]
pub struct NewPoi {
    pub map_id: Uuid,
    pub created_by: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub position: Position,
    pub max_participants: u32,
}

impl NewPoi {
    pub fn from_request(map_id: Uuid, created_by: Uuid, req: CreatePoiRequest) -> Self {
        Self {
            map_id,
            created_by,
            name: req.name.trim().to_string(),
            description: req.description,
            position: req.position,
            max_participants: req.max_participants,
        }
    }
}

/// Result of an atomic capacity-checked join. `AtCapacity` is a normal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined { count: u64 },
    AlreadyMember { count: u64 },
    AtCapacity { count: u64, max: u64 },
}

impl JoinOutcome {
    pub fn is_member(&self) -> bool {
        matches!(self, JoinOutcome::Joined { .. } | JoinOutcome::AlreadyMember { .. })
    }

    pub fn count(&self) -> u64 {
        match self {
            JoinOutcome::Joined { count }
            | JoinOutcome::AlreadyMember { count }
            | JoinOutcome::AtCapacity { count, .. } => *count,
        }
    }
}

/// A POI with its authoritative live membership.
#[derive(Debug, Clone, Serialize)]
pub struct PoiSnapshot {
    #[serde(flatten)]
    pub poi: PoiRecord,
    pub participant_count: u64,
    pub participants: Vec<Uuid>,
}
