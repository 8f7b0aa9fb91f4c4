//! POI membership: one set of session ids per POI in the shared store.
//!
//! `join_with_capacity_check` is the only capacity-enforcing path and runs as
//! a single atomic step in the store, so concurrent joins for the last slot
//! cannot both succeed.

use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::JoinOutcome;
use crate::repositories::{CappedAdd, EphemeralStore};

const MEMBERS_PATTERN: &str = "poi:*:members";

fn members_key(poi_id: Uuid) -> String {
    format!("poi:{}:members", poi_id)
}

fn poi_id_from_key(key: &str) -> Option<Uuid> {
    key.strip_prefix("poi:")?
        .strip_suffix(":members")
        .and_then(|id| Uuid::parse_str(id).ok())
}

fn parse_members(raw: Vec<String>) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = raw.iter().filter_map(|m| Uuid::parse_str(m).ok()).collect();
    ids.sort();
    ids
}

#[derive(Clone)]
pub struct MembershipRegistry {
    store: Arc<dyn EphemeralStore>,
}

impl MembershipRegistry {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    /// Idempotent add without a capacity check.
    pub async fn join(&self, poi_id: Uuid, session_id: Uuid) -> AppResult<()> {
        self.store
            .sadd(&members_key(poi_id), &session_id.to_string())
            .await?;
        Ok(())
    }

    /// Idempotent. Returns whether the session was a member.
    pub async fn leave(&self, poi_id: Uuid, session_id: Uuid) -> AppResult<bool> {
        self.store
            .srem(&members_key(poi_id), &session_id.to_string())
            .await
    }

    pub async fn count(&self, poi_id: Uuid) -> AppResult<u64> {
        self.store.scard(&members_key(poi_id)).await
    }

    pub async fn members(&self, poi_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(parse_members(self.store.smembers(&members_key(poi_id)).await?))
    }

    pub async fn is_member(&self, poi_id: Uuid, session_id: Uuid) -> AppResult<bool> {
        self.store
            .sismember(&members_key(poi_id), &session_id.to_string())
            .await
    }

    /// Advisory only: the answer may be stale by the time the caller acts on it.
    pub async fn has_capacity(&self, poi_id: Uuid, max: u64) -> AppResult<bool> {
        Ok(self.count(poi_id).await? < max)
    }

    #[instrument(skip(self))]
    pub async fn join_with_capacity_check(
        &self,
        poi_id: Uuid,
        session_id: Uuid,
        max: u64,
    ) -> AppResult<JoinOutcome> {
        let outcome = match self
            .store
            .sadd_capped(&members_key(poi_id), &session_id.to_string(), max)
            .await?
        {
            CappedAdd::Added { size } => JoinOutcome::Joined { count: size },
            CappedAdd::AlreadyPresent { size } => JoinOutcome::AlreadyMember { count: size },
            CappedAdd::Full { size } => JoinOutcome::AtCapacity { count: size, max },
        };
        debug!(?outcome, "capacity-checked join");
        Ok(outcome)
    }

    /// Drop the whole set (POI deletion). Returns the sessions that were in it.
    #[instrument(skip(self))]
    pub async fn remove_all_members(&self, poi_id: Uuid) -> AppResult<Vec<Uuid>> {
        let key = members_key(poi_id);
        let members = parse_members(self.store.smembers(&key).await?);
        self.store.del(&key).await?;
        info!(count = members.len(), "removed all POI members");
        Ok(members)
    }

    /// Disconnect cleanup. Scans every POI set because the session's recorded
    /// current POI may be stale. Returns the POIs it was removed from.
    #[instrument(skip(self))]
    pub async fn remove_session_from_all_pois(&self, session_id: Uuid) -> AppResult<Vec<Uuid>> {
        let member = session_id.to_string();
        let mut removed_from = Vec::new();
        for key in self.store.keys(MEMBERS_PATTERN).await? {
            if self.store.srem(&key, &member).await? {
                if let Some(poi_id) = poi_id_from_key(&key) {
                    removed_from.push(poi_id);
                }
            }
        }
        if !removed_from.is_empty() {
            info!(pois = removed_from.len(), "session removed from POIs");
        }
        Ok(removed_from)
    }

    pub async fn pois_for_session(&self, session_id: Uuid) -> AppResult<Vec<Uuid>> {
        let member = session_id.to_string();
        let mut pois = Vec::new();
        for key in self.store.keys(MEMBERS_PATTERN).await? {
            if self.store.sismember(&key, &member).await? {
                if let Some(poi_id) = poi_id_from_key(&key) {
                    pois.push(poi_id);
                }
            }
        }
        pois.sort();
        Ok(pois)
    }
}
