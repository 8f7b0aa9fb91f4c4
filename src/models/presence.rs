//! Session presence: where a connected avatar is and what it is doing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A point on the map, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Reject non-finite or out-of-range coordinates.
    pub fn validate(&self) -> AppResult<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::Validation(format!(
                "latitude must be within [-90, 90], got {}",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::Validation(format!(
                "longitude must be within [-180, 180], got {}",
                self.lng
            )));
        }
        Ok(())
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_meters(&self, other: &Position) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
    }
}

/// Ephemeral presence record, keyed by session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPresence {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub map_id: Uuid,
    pub avatar_position: Position,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub current_poi: Option<Uuid>,
}

impl SessionPresence {
    pub fn new(session_id: Uuid, user_id: Uuid, map_id: Uuid, avatar_position: Position) -> Self {
        Self {
            session_id,
            user_id,
            map_id,
            avatar_position,
            last_active: Utc::now(),
            current_poi: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_validation_bounds() {
        assert!(Position::new(0.0, 0.0).validate().is_ok());
        assert!(Position::new(90.0, -180.0).validate().is_ok());
        assert!(Position::new(90.5, 0.0).validate().is_err());
        assert!(Position::new(0.0, 181.0).validate().is_err());
        assert!(Position::new(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn distance_between_nearby_points() {
        // ~111 m per 0.001 degree of latitude
        let a = Position::new(48.0, 2.0);
        let b = Position::new(48.001, 2.0);
        let d = a.distance_meters(&b);
        assert!((d - 111.19).abs() < 1.0, "distance was {d}");
        assert_eq!(a.distance_meters(&a), 0.0);
    }

    #[test]
    fn presence_roundtrips_without_current_poi_field() {
        let json = serde_json::json!({
            "session_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "map_id": Uuid::new_v4(),
            "avatar_position": { "lat": 1.0, "lng": 2.0 },
            "last_active": Utc::now(),
        });
        let presence: SessionPresence = serde_json::from_value(json).unwrap();
        assert_eq!(presence.current_poi, None);
    }
}
