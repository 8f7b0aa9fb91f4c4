//! Domain events and the generic envelope they travel in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::presence::Position;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarMoved {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub map_id: Uuid,
    pub position: Position,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiCreated {
    pub poi_id: Uuid,
    pub map_id: Uuid,
    pub name: String,
    pub position: Position,
    pub max_participants: u32,
    pub created_by: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// `current_count` is advisory: re-query the registry when precision matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiJoined {
    pub poi_id: Uuid,
    pub map_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub current_count: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiLeft {
    pub poi_id: Uuid,
    pub map_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub current_count: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiUpdated {
    pub poi_id: Uuid,
    pub map_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub max_participants: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiDeleted {
    pub poi_id: Uuid,
    pub map_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJoinedMap {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub map_id: Uuid,
    pub position: Position,
    pub timestamp: DateTime<Utc>,
}

/// Departure: other clients drop the avatar on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeftMap {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub map_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Every state change on a map produces one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DomainEvent {
    AvatarMoved(AvatarMoved),
    PoiCreated(PoiCreated),
    PoiJoined(PoiJoined),
    PoiLeft(PoiLeft),
    PoiUpdated(PoiUpdated),
    PoiDeleted(PoiDeleted),
    UserJoinedMap(UserJoinedMap),
    UserLeftMap(UserLeftMap),
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::AvatarMoved(_) => "avatar_moved",
            DomainEvent::PoiCreated(_) => "poi_created",
            DomainEvent::PoiJoined(_) => "poi_joined",
            DomainEvent::PoiLeft(_) => "poi_left",
            DomainEvent::PoiUpdated(_) => "poi_updated",
            DomainEvent::PoiDeleted(_) => "poi_deleted",
            DomainEvent::UserJoinedMap(_) => "user_joined_map",
            DomainEvent::UserLeftMap(_) => "user_left_map",
        }
    }

    pub fn map_id(&self) -> Uuid {
        match self {
            DomainEvent::AvatarMoved(e) => e.map_id,
            DomainEvent::PoiCreated(e) => e.map_id,
            DomainEvent::PoiJoined(e) => e.map_id,
            DomainEvent::PoiLeft(e) => e.map_id,
            DomainEvent::PoiUpdated(e) => e.map_id,
            DomainEvent::PoiDeleted(e) => e.map_id,
            DomainEvent::UserJoinedMap(e) => e.map_id,
            DomainEvent::UserLeftMap(e) => e.map_id,
        }
    }

    /// The user the event is about, when it should also reach that user's channel.
    pub fn affected_user(&self) -> Option<Uuid> {
        match self {
            DomainEvent::PoiJoined(e) => Some(e.user_id),
            DomainEvent::PoiLeft(e) => Some(e.user_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::AvatarMoved(e) => e.timestamp,
            DomainEvent::PoiCreated(e) => e.timestamp,
            DomainEvent::PoiJoined(e) => e.timestamp,
            DomainEvent::PoiLeft(e) => e.timestamp,
            DomainEvent::PoiUpdated(e) => e.timestamp,
            DomainEvent::PoiDeleted(e) => e.timestamp,
            DomainEvent::UserJoinedMap(e) => e.timestamp,
            DomainEvent::UserLeftMap(e) => e.timestamp,
        }
    }

    pub fn to_envelope(&self) -> Result<EventEnvelope, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        let payload = value
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok(EventEnvelope {
            event_type: self.event_type().to_string(),
            payload,
            timestamp: self.timestamp(),
        })
    }
}

/// Generic record delivered to subscribers and forwarded verbatim to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Parse a raw pub/sub message. Anything without a type, an object payload
    /// and a timestamp is malformed.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let envelope: EventEnvelope = serde_json::from_str(raw)?;
        if envelope.event_type.is_empty() || !envelope.payload.is_object() {
            return Err(serde::de::Error::custom(
                "envelope requires a non-empty type and an object payload",
            ));
        }
        Ok(envelope)
    }

    /// Routing map of the event, read from the payload.
    pub fn map_id(&self) -> Option<Uuid> {
        self.payload
            .get("map_id")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Recover the typed event, if the type is one this build knows.
    pub fn to_event(&self) -> Result<DomainEvent, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": self.event_type,
            "payload": self.payload,
        }))
    }
}

/// WebSocket client message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    Move { data: Position },
    JoinPoi { data: PoiRef },
    LeavePoi { data: PoiRef },
    Heartbeat,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiRef {
    pub poi_id: Uuid,
}
