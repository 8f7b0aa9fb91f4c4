//! In-process repositories for `STORAGE_MODE=memory` and tests. Same
//! constraints as the Postgres schema: one active session per user and map,
//! POI spacing checked under the same lock as the insert.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{poi_not_found, session_not_found, too_close, PoiRepository, SessionRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    NewPoi, NewSession, PoiRecord, PoiUpdate, Position, SessionRecord, MIN_POI_SPACING_METERS,
};

#[derive(Clone, Default)]
pub struct MemorySessionRepository {
    sessions: Arc<Mutex<HashMap<Uuid, SessionRecord>>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn find_active(&self, user_id: Uuid, map_id: Uuid) -> AppResult<Option<SessionRecord>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .values()
            .find(|s| s.is_active && s.user_id == user_id && s.map_id == map_id)
            .cloned())
    }

    async fn create(&self, new: NewSession) -> AppResult<SessionRecord> {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .values()
            .any(|s| s.is_active && s.user_id == new.user_id && s.map_id == new.map_id)
        {
            return Err(AppError::Conflict(
                "user already has an active session on this map".to_string(),
            ));
        }
        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            map_id: new.map_id,
            position: new.position,
            current_poi: None,
            is_active: true,
            last_active: now,
            created_at: now,
        };
        sessions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, session_id: Uuid) -> AppResult<SessionRecord> {
        self.sessions
            .lock()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| session_not_found(session_id))
    }

    async fn touch(
        &self,
        session_id: Uuid,
        at: DateTime<Utc>,
        position: Option<Position>,
    ) -> AppResult<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&session_id)
            .filter(|s| s.is_active)
            .ok_or_else(|| session_not_found(session_id))?;
        session.last_active = session.last_active.max(at);
        if let Some(position) = position {
            session.position = position;
        }
        Ok(())
    }

    async fn set_current_poi(&self, session_id: Uuid, poi_id: Option<Uuid>) -> AppResult<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        session.current_poi = poi_id;
        Ok(())
    }

    async fn clear_poi(&self, poi_id: Uuid) -> AppResult<u64> {
        let mut sessions = self.sessions.lock().await;
        let mut cleared = 0;
        for session in sessions.values_mut() {
            if session.current_poi == Some(poi_id) {
                session.current_poi = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn deactivate(&self, session_id: Uuid) -> AppResult<bool> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&session_id) {
            Some(session) if session.is_active => {
                session.is_active = false;
                session.current_poi = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_inactive(&self, timeout: Duration) -> AppResult<Vec<SessionRecord>> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::zero());
        let mut sessions = self.sessions.lock().await;
        let mut expired = Vec::new();
        for session in sessions.values_mut() {
            if session.is_active && session.last_active < cutoff {
                session.is_active = false;
                expired.push(session.clone());
            }
        }
        Ok(expired)
    }
}

#[derive(Clone, Default)]
pub struct MemoryPoiRepository {
    pois: Arc<Mutex<HashMap<Uuid, PoiRecord>>>,
}

impl MemoryPoiRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoiRepository for MemoryPoiRepository {
    async fn create(&self, new: NewPoi) -> AppResult<PoiRecord> {
        let mut pois = self.pois.lock().await;
        if pois.values().any(|p| {
            p.map_id == new.map_id
                && p.position.distance_meters(&new.position) < MIN_POI_SPACING_METERS
        }) {
            return Err(too_close());
        }
        let now = Utc::now();
        let record = PoiRecord {
            id: Uuid::new_v4(),
            map_id: new.map_id,
            name: new.name,
            description: new.description,
            position: new.position,
            max_participants: new.max_participants,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        pois.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, poi_id: Uuid) -> AppResult<PoiRecord> {
        self.pois
            .lock()
            .await
            .get(&poi_id)
            .cloned()
            .ok_or_else(|| poi_not_found(poi_id))
    }

    async fn update(&self, poi_id: Uuid, update: &PoiUpdate) -> AppResult<PoiRecord> {
        let mut pois = self.pois.lock().await;
        let poi = pois.get_mut(&poi_id).ok_or_else(|| poi_not_found(poi_id))?;
        if let Some(name) = &update.name {
            poi.name = name.trim().to_string();
        }
        if let Some(description) = &update.description {
            poi.description = Some(description.clone());
        }
        if let Some(max) = update.max_participants {
            poi.max_participants = max;
        }
        poi.updated_at = Utc::now();
        Ok(poi.clone())
    }

    async fn delete(&self, poi_id: Uuid) -> AppResult<PoiRecord> {
        self.pois
            .lock()
            .await
            .remove(&poi_id)
            .ok_or_else(|| poi_not_found(poi_id))
    }

    async fn list_for_map(&self, map_id: Uuid) -> AppResult<Vec<PoiRecord>> {
        let pois = self.pois.lock().await;
        let mut listed: Vec<PoiRecord> = pois.values().filter(|p| p.map_id == map_id).cloned().collect();
        listed.sort_by_key(|p| (p.created_at, p.id));
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_poi(map_id: Uuid, lat: f64, lng: f64) -> NewPoi {
        NewPoi {
            map_id,
            created_by: Uuid::new_v4(),
            name: "Fountain".to_string(),
            description: None,
            position: Position::new(lat, lng),
            max_participants: 4,
        }
    }

    #[tokio::test]
    async fn one_active_session_per_user_and_map() {
        let repo = MemorySessionRepository::new();
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());
        let new = NewSession {
            user_id: user,
            map_id: map,
            position: Position::new(0.0, 0.0),
        };
        let first = repo.create(new.clone()).await.unwrap();
        assert!(matches!(repo.create(new.clone()).await, Err(AppError::Conflict(_))));

        assert!(repo.deactivate(first.id).await.unwrap());
        assert!(!repo.deactivate(first.id).await.unwrap());
        assert!(repo.find_active(user, map).await.unwrap().is_none());
        assert!(repo.create(new).await.is_ok());
    }

    #[tokio::test]
    async fn expire_inactive_marks_idle_sessions() {
        let repo = MemorySessionRepository::new();
        let s = repo
            .create(NewSession {
                user_id: Uuid::new_v4(),
                map_id: Uuid::new_v4(),
                position: Position::new(0.0, 0.0),
            })
            .await
            .unwrap();
        assert!(repo.expire_inactive(Duration::from_secs(60)).await.unwrap().is_empty());

        repo.sessions.lock().await.get_mut(&s.id).unwrap().last_active =
            Utc::now() - ChronoDuration::minutes(5);
        let expired = repo.expire_inactive(Duration::from_secs(60)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert!(!repo.get(s.id).await.unwrap().is_active);
        assert!(repo.touch(s.id, Utc::now(), None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn pois_must_be_spaced_apart() {
        let repo = MemoryPoiRepository::new();
        let map = Uuid::new_v4();
        repo.create(new_poi(map, 48.8566, 2.3522)).await.unwrap();
        // ~11 m away.
        let err = repo.create(new_poi(map, 48.8567, 2.3522)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        // ~1.1 km away.
        assert!(repo.create(new_poi(map, 48.8666, 2.3522)).await.is_ok());
        // Same spot, other map.
        assert!(repo.create(new_poi(Uuid::new_v4(), 48.8566, 2.3522)).await.is_ok());
        assert_eq!(repo.list_for_map(map).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let repo = MemoryPoiRepository::new();
        let poi = repo.create(new_poi(Uuid::new_v4(), 10.0, 10.0)).await.unwrap();
        let updated = repo
            .update(
                poi.id,
                &PoiUpdate {
                    name: Some("  Plaza ".to_string()),
                    max_participants: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Plaza");
        assert_eq!(updated.max_participants, 2);

        assert_eq!(repo.delete(poi.id).await.unwrap().id, poi.id);
        assert!(repo.get(poi.id).await.unwrap_err().is_not_found());
    }
}
