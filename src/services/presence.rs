//! Ephemeral presence: avatar position, activity and current POI per session,
//! with a sliding TTL refreshed on every write.
//!
//! Layout in the shared store:
//! - `presence:{session}`: JSON [`SessionPresence`] (its `current_poi` is ignored)
//! - `presence:{session}:poi`: current POI id, written independently so a
//!   position update can never overwrite a concurrent POI transition
//! - `map:{map}:sessions`: index of sessions per map, pruned lazily. Every
//!   write to a member refreshes its expiry, so an abandoned map's index ages
//!   out with its last session.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Position, SessionPresence};
use crate::repositories::EphemeralStore;

fn presence_key(session_id: Uuid) -> String {
    format!("presence:{}", session_id)
}

fn poi_key(session_id: Uuid) -> String {
    format!("presence:{}:poi", session_id)
}

fn map_index_key(map_id: Uuid) -> String {
    format!("map:{}:sessions", map_id)
}

fn not_found(session_id: Uuid) -> AppError {
    AppError::NotFound(format!("session {} is not present", session_id))
}

/// A session purged by [`PresenceStore::cleanup_expired`]. `last_known` is
/// `None` when the entry had already expired passively.
#[derive(Debug, Clone)]
pub struct ExpiredPresence {
    pub session_id: Uuid,
    pub last_known: Option<SessionPresence>,
}

#[derive(Clone)]
pub struct PresenceStore {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
    activity_timeout: Duration,
}

impl PresenceStore {
    /// `ttl` applies to writes that do not name one; `activity_timeout` is how
    /// long `last_active` may lag before `cleanup_expired` purges the entry.
    pub fn new(store: Arc<dyn EphemeralStore>, ttl: Duration, activity_timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            activity_timeout,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[instrument(skip(self, data), fields(session_id = %data.session_id, map_id = %data.map_id))]
    pub async fn set(&self, data: &SessionPresence, ttl: Duration) -> AppResult<()> {
        let payload = serde_json::to_string(data)?;
        self.store
            .set_ex(&presence_key(data.session_id), &payload, ttl)
            .await?;
        match data.current_poi {
            Some(poi_id) => {
                self.store
                    .set_ex(&poi_key(data.session_id), &poi_id.to_string(), ttl)
                    .await?
            }
            None => {
                self.store.del(&poi_key(data.session_id)).await?;
            }
        }
        self.store
            .sadd(&map_index_key(data.map_id), &data.session_id.to_string())
            .await?;
        self.refresh_index(data.map_id, ttl).await?;
        debug!("presence set");
        Ok(())
    }

    pub async fn get(&self, session_id: Uuid) -> AppResult<SessionPresence> {
        let raw = self
            .store
            .get(&presence_key(session_id))
            .await?
            .ok_or_else(|| not_found(session_id))?;
        let mut presence: SessionPresence = serde_json::from_str(&raw)?;
        presence.current_poi = self
            .store
            .get(&poi_key(session_id))
            .await?
            .and_then(|id| Uuid::parse_str(&id).ok());
        Ok(presence)
    }

    pub async fn update_activity(
        &self,
        session_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<SessionPresence> {
        self.modify(session_id, |p| p.last_active = at).await
    }

    /// Move the avatar. Also bumps `last_active` and the TTL.
    pub async fn update_position(
        &self,
        session_id: Uuid,
        position: Position,
    ) -> AppResult<SessionPresence> {
        self.modify(session_id, |p| {
            p.avatar_position = position;
            p.last_active = Utc::now();
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_current_poi(&self, session_id: Uuid, poi_id: Option<Uuid>) -> AppResult<()> {
        let presence = self.get(session_id).await?;
        if !self.store.expire(&presence_key(session_id), self.ttl).await? {
            return Err(not_found(session_id));
        }
        self.refresh_index(presence.map_id, self.ttl).await?;
        match poi_id {
            Some(poi_id) => {
                self.store
                    .set_ex(&poi_key(session_id), &poi_id.to_string(), self.ttl)
                    .await?
            }
            None => {
                self.store.del(&poi_key(session_id)).await?;
            }
        }
        Ok(())
    }

    /// Delete the entry and unlist it from its map. Returns what was removed.
    #[instrument(skip(self))]
    pub async fn remove(&self, session_id: Uuid) -> AppResult<SessionPresence> {
        let presence = self.get(session_id).await?;
        self.evict(session_id, presence.map_id).await?;
        info!(map_id = %presence.map_id, "presence removed");
        Ok(presence)
    }

    /// Delete whatever is left of the entry and unlist it from `map_id`, even
    /// when the entry itself has already expired. Returns whether it was live.
    #[instrument(skip(self))]
    pub async fn evict(&self, session_id: Uuid, map_id: Uuid) -> AppResult<bool> {
        let live = self.store.del(&presence_key(session_id)).await?;
        self.store.del(&poi_key(session_id)).await?;
        self.store
            .srem(&map_index_key(map_id), &session_id.to_string())
            .await?;
        debug!(live, "presence evicted");
        Ok(live)
    }

    /// Every live session on the map. Index entries whose presence has expired
    /// are pruned on the way.
    pub async fn list_active_for_map(&self, map_id: Uuid) -> AppResult<Vec<SessionPresence>> {
        let index = map_index_key(map_id);
        let mut active = Vec::new();
        for member in self.store.smembers(&index).await? {
            let Ok(session_id) = Uuid::parse_str(&member) else {
                self.store.srem(&index, &member).await?;
                continue;
            };
            match self.get(session_id).await {
                Ok(presence) => active.push(presence),
                Err(e) if e.is_not_found() => {
                    self.store.srem(&index, &member).await?;
                }
                Err(e) => return Err(e),
            }
        }
        active.sort_by_key(|p| p.session_id);
        Ok(active)
    }

    /// Renew the TTL only.
    pub async fn heartbeat(&self, session_id: Uuid, ttl: Duration) -> AppResult<()> {
        let presence = self.get(session_id).await?;
        if !self.store.expire(&presence_key(session_id), ttl).await? {
            return Err(not_found(session_id));
        }
        self.store.expire(&poi_key(session_id), ttl).await?;
        self.refresh_index(presence.map_id, ttl).await
    }

    /// Purge entries on the map whose `last_active` predates the activity
    /// timeout. Returns how many were purged.
    pub async fn cleanup_expired(&self, map_id: Uuid) -> AppResult<usize> {
        Ok(self.purge_expired(map_id).await?.len())
    }

    /// Same as [`Self::cleanup_expired`] but hands back the purged sessions so
    /// their memberships can be reconciled.
    pub async fn purge_expired(&self, map_id: Uuid) -> AppResult<Vec<ExpiredPresence>> {
        let index = map_index_key(map_id);
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.activity_timeout).unwrap_or(ChronoDuration::zero());
        let mut purged = Vec::new();
        for member in self.store.smembers(&index).await? {
            let Ok(session_id) = Uuid::parse_str(&member) else {
                self.store.srem(&index, &member).await?;
                continue;
            };
            let last_known = match self.get(session_id).await {
                Ok(presence) if presence.last_active >= cutoff => continue,
                Ok(presence) => Some(presence),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            self.store.del(&presence_key(session_id)).await?;
            self.store.del(&poi_key(session_id)).await?;
            self.store.srem(&index, &member).await?;
            purged.push(ExpiredPresence {
                session_id,
                last_known,
            });
        }
        if !purged.is_empty() {
            info!(map_id = %map_id, count = purged.len(), "purged expired presence");
        }
        Ok(purged)
    }

    async fn modify<F>(&self, session_id: Uuid, apply: F) -> AppResult<SessionPresence>
    where
        F: FnOnce(&mut SessionPresence),
    {
        let mut presence = self.get(session_id).await?;
        apply(&mut presence);
        let payload = serde_json::to_string(&presence)?;
        // XX: never resurrect an entry that expired between read and write.
        if !self
            .store
            .replace_ex(&presence_key(session_id), &payload, self.ttl)
            .await?
        {
            return Err(not_found(session_id));
        }
        self.store.expire(&poi_key(session_id), self.ttl).await?;
        self.refresh_index(presence.map_id, self.ttl).await?;
        Ok(presence)
    }

    /// Keep the map index alive at least as long as the member just written.
    async fn refresh_index(&self, map_id: Uuid, ttl: Duration) -> AppResult<()> {
        self.store
            .expire(&map_index_key(map_id), ttl.max(self.ttl))
            .await?;
        Ok(())
    }
}
