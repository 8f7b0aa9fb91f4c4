//! Session reconciliation: keeps the durable session row and the ephemeral
//! presence/membership state in step across connect, heartbeat, movement,
//! disconnect and expiry.
//!
//! Departure (explicit or swept) always runs the same cleanup: drop the
//! session from every POI set, remove its presence, deactivate the row, then
//! announce `poi_left` per POI and `user_left_map`. Every step treats
//! "already gone" as success, so a sweep and a disconnect racing on the same
//! session converge.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::db::SessionRepository;
use crate::error::{AppError, AppResult};
use crate::models::{
    AvatarMoved, NewSession, PoiLeft, Position, RateAction, SessionPresence, UserJoinedMap,
    UserLeftMap,
};
use crate::services::events::EventFanout;
use crate::services::membership::MembershipRegistry;
use crate::services::presence::PresenceStore;
use crate::services::rate_limit::RateLimiter;
use crate::services::retry::RetryPolicy;

/// Result of [`SessionReconciler::connect`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedSession {
    pub presence: SessionPresence,
    /// True when an existing durable session was picked up again.
    pub resumed: bool,
}

#[derive(Clone)]
pub struct SessionReconciler {
    presence: PresenceStore,
    membership: MembershipRegistry,
    events: EventFanout,
    rate_limiter: RateLimiter,
    sessions: Arc<dyn SessionRepository>,
    retry: RetryPolicy,
    session_timeout: Duration,
}

impl SessionReconciler {
    pub fn new(
        presence: PresenceStore,
        membership: MembershipRegistry,
        events: EventFanout,
        rate_limiter: RateLimiter,
        sessions: Arc<dyn SessionRepository>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            presence,
            membership,
            events,
            rate_limiter,
            sessions,
            retry: RetryPolicy::default(),
            session_timeout,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resume the user's active session on the map, or create one, and mirror
    /// it into presence. `position` overrides the stored one when given; a new
    /// session without one starts at the origin.
    ///
    /// An active session whose presence is still live belongs to another open
    /// connection and fails with `Conflict`; only a lapsed one is resumed.
    #[instrument(skip(self, position))]
    pub async fn connect(
        &self,
        user_id: Uuid,
        map_id: Uuid,
        position: Option<Position>,
    ) -> AppResult<ConnectedSession> {
        if let Some(position) = &position {
            position.validate()?;
        }
        self.rate_limiter
            .check_rate_limit(&user_id.to_string(), RateAction::Connect)
            .await?;

        let active = self
            .retry
            .run("find_active_session", move || self.sessions.find_active(user_id, map_id))
            .await?;
        let (mut presence, resumed) = match active {
            Some(record) => {
                let session_id = record.id;
                match self.retry.run("presence_get", move || self.presence.get(session_id)).await {
                    Ok(_) => {
                        warn!(session_id = %session_id, "session already live on another connection");
                        return Err(AppError::Conflict(
                            "user already has a live session on this map".to_string(),
                        ));
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                let mut presence = record.to_presence();
                presence.current_poi = self.verified_poi(record.id, record.current_poi).await?;
                if presence.current_poi != record.current_poi {
                    self.sessions
                        .set_current_poi(record.id, presence.current_poi)
                        .await?;
                }
                (presence, true)
            }
            None => {
                let record = self
                    .sessions
                    .create(NewSession {
                        user_id,
                        map_id,
                        position: position.unwrap_or(Position::new(0.0, 0.0)),
                    })
                    .await?;
                (record.to_presence(), false)
            }
        };
        if let Some(position) = position {
            presence.avatar_position = position;
        }
        presence.last_active = Utc::now();

        let ttl = self.presence.ttl();
        let written = &presence;
        self.retry
            .run("presence_set", move || self.presence.set(written, ttl))
            .await?;
        if resumed {
            let (session_id, at, position) =
                (presence.session_id, presence.last_active, presence.avatar_position);
            self.retry
                .run("touch_session", move || self.sessions.touch(session_id, at, Some(position)))
                .await?;
        }
        info!(session_id = %presence.session_id, resumed, "session connected");

        self.events
            .publish_user_joined_map(UserJoinedMap {
                session_id: presence.session_id,
                user_id,
                map_id,
                position: presence.avatar_position,
                timestamp: presence.last_active,
            })
            .await?;
        Ok(ConnectedSession { presence, resumed })
    }

    /// Client keep-alive: refresh the presence TTL and the durable `last_active`.
    pub async fn heartbeat(&self, session_id: Uuid) -> AppResult<SessionPresence> {
        let current = self
            .retry
            .run("presence_get", move || self.presence.get(session_id))
            .await?;
        self.rate_limiter
            .check_rate_limit(&current.user_id.to_string(), RateAction::Heartbeat)
            .await?;
        let now = Utc::now();
        let presence = self
            .retry
            .run("presence_update_activity", move || {
                self.presence.update_activity(session_id, now)
            })
            .await?;
        self.retry
            .run("touch_session", move || self.sessions.touch(session_id, now, None))
            .await?;
        debug!(session_id = %session_id, "heartbeat");
        Ok(presence)
    }

    pub async fn move_avatar(
        &self,
        session_id: Uuid,
        position: Position,
    ) -> AppResult<SessionPresence> {
        position.validate()?;
        let current = self
            .retry
            .run("presence_get", move || self.presence.get(session_id))
            .await?;
        self.rate_limiter
            .check_rate_limit(&current.user_id.to_string(), RateAction::MoveAvatar)
            .await?;
        let presence = self
            .retry
            .run("presence_update_position", move || {
                self.presence.update_position(session_id, position)
            })
            .await?;
        let at = presence.last_active;
        self.retry
            .run("touch_session", move || self.sessions.touch(session_id, at, Some(position)))
            .await?;
        self.events
            .publish_avatar_moved(AvatarMoved {
                session_id,
                user_id: presence.user_id,
                map_id: presence.map_id,
                position,
                timestamp: presence.last_active,
            })
            .await?;
        Ok(presence)
    }

    /// Explicit disconnect. Returns false when the session was already gone.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, session_id: Uuid) -> AppResult<bool> {
        let owner = match self
            .retry
            .run("presence_get", move || self.presence.get(session_id))
            .await
        {
            Ok(p) => Some((p.user_id, p.map_id)),
            Err(e) if e.is_not_found() => match self.sessions.get(session_id).await {
                Ok(record) if record.is_active => Some((record.user_id, record.map_id)),
                Ok(_) => None,
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        };
        let Some(owner) = owner else {
            debug!("session already gone");
            return Ok(false);
        };
        self.release(session_id, Some(owner), true).await?;
        Ok(true)
    }

    /// Backstop for clients that vanished without disconnecting: deactivate
    /// every durable session idle beyond `timeout` and clean up after it.
    #[instrument(skip(self))]
    pub async fn expire_old_sessions(&self, timeout: Duration) -> AppResult<usize> {
        let expired = self
            .retry
            .run("expire_inactive", move || self.sessions.expire_inactive(timeout))
            .await?;
        for record in &expired {
            self.release(record.id, Some((record.user_id, record.map_id)), false)
                .await?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired idle sessions");
        }
        Ok(expired.len())
    }

    /// Live roster for the map. Idle sessions are purged and fully
    /// reconciled first, so the answer never lists a stale avatar.
    ///
    /// A purged session whose durable row is already inactive has departed
    /// through disconnect or the sweeper, and is not announced again.
    pub async fn map_roster(&self, map_id: Uuid) -> AppResult<Vec<SessionPresence>> {
        for purged in self.presence.purge_expired(map_id).await? {
            let session_id = purged.session_id;
            let record = match self.retry.run("get_session", move || self.sessions.get(session_id)).await {
                Ok(record) => Some(record),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            let owner = match (record, purged.last_known) {
                (Some(record), _) if !record.is_active => {
                    debug!(session_id = %session_id, "purged session already departed");
                    continue;
                }
                (Some(record), _) => Some((record.user_id, record.map_id)),
                (None, Some(p)) => Some((p.user_id, p.map_id)),
                (None, None) => None,
            };
            self.release(session_id, owner, true).await?;
        }
        self.presence.list_active_for_map(map_id).await
    }

    /// Run [`Self::expire_old_sessions`] every `interval` until `cancel` resolves.
    pub fn spawn_sweeper<C>(&self, interval: Duration, cancel: C) -> JoinHandle<()>
    where
        C: Future<Output = ()> + Send + 'static,
    {
        let reconciler = self.clone();
        tokio::spawn(async move {
            tokio::pin!(cancel);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = reconciler
                    .expire_old_sessions(reconciler.session_timeout)
                    .await
                {
                    error!(error = %e, "session sweep failed");
                }
            }
            info!("session sweeper stopped");
        })
    }

    /// `current_poi` from the durable row, kept only if the registry agrees.
    /// Falls back to any POI the registry still lists the session under.
    async fn verified_poi(&self, session_id: Uuid, recorded: Option<Uuid>) -> AppResult<Option<Uuid>> {
        if let Some(poi_id) = recorded {
            if self.membership.is_member(poi_id, session_id).await? {
                return Ok(Some(poi_id));
            }
        }
        Ok(self
            .membership
            .pois_for_session(session_id)
            .await?
            .into_iter()
            .next())
    }

    /// Shared departure path. `owner` is `(user_id, map_id)` when known; without
    /// it no events can be routed.
    async fn release(
        &self,
        session_id: Uuid,
        owner: Option<(Uuid, Uuid)>,
        deactivate: bool,
    ) -> AppResult<()> {
        let left = self
            .retry
            .run("remove_session_from_all_pois", move || {
                self.membership.remove_session_from_all_pois(session_id)
            })
            .await?;

        // With the map known, the index entry goes even if the presence
        // itself already expired.
        match owner {
            Some((_, map_id)) => {
                self.retry
                    .run("presence_evict", move || self.presence.evict(session_id, map_id))
                    .await?;
            }
            None => match self
                .retry
                .run("presence_remove", move || self.presence.remove(session_id))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            },
        }

        if deactivate {
            self.retry
                .run("deactivate_session", move || self.sessions.deactivate(session_id))
                .await?;
        }

        let Some((user_id, map_id)) = owner else {
            warn!(session_id = %session_id, "departed session has no known owner, skipping events");
            return Ok(());
        };
        let now = Utc::now();
        for poi_id in left {
            let current_count = self
                .retry
                .run("poi_member_count", move || self.membership.count(poi_id))
                .await?;
            self.events
                .publish_poi_left(PoiLeft {
                    poi_id,
                    map_id,
                    user_id,
                    session_id,
                    current_count,
                    timestamp: now,
                })
                .await?;
        }
        self.events
            .publish_user_left_map(UserLeftMap {
                session_id,
                user_id,
                map_id,
                timestamp: now,
            })
            .await?;
        info!(session_id = %session_id, map_id = %map_id, "session departed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemorySessionRepository;
    use crate::models::{Channel, DomainEvent};
    use crate::repositories::testing::FaultyStore;
    use crate::repositories::{EphemeralStore, MemoryStore};
    use crate::services::rate_limit::SystemClock;
    use std::collections::HashMap;

    struct Fixture {
        reconciler: SessionReconciler,
        presence: PresenceStore,
        membership: MembershipRegistry,
        events: EventFanout,
        sessions: Arc<MemorySessionRepository>,
    }

    fn fixture() -> Fixture {
        fixture_on(Arc::new(MemoryStore::default()))
    }

    fn fixture_on(store: Arc<dyn EphemeralStore>) -> Fixture {
        let presence = PresenceStore::new(store.clone(), Duration::from_secs(60), Duration::from_secs(30));
        let membership = MembershipRegistry::new(store.clone());
        let events = EventFanout::new(store.clone());
        let limiter = RateLimiter::new(store, Arc::new(SystemClock), HashMap::new());
        let sessions = Arc::new(MemorySessionRepository::new());
        let reconciler = SessionReconciler::new(
            presence.clone(),
            membership.clone(),
            events.clone(),
            limiter,
            sessions.clone(),
            Duration::from_secs(300),
        )
        .with_retry(RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        });
        Fixture {
            reconciler,
            presence,
            membership,
            events,
            sessions,
        }
    }

    #[tokio::test]
    async fn connect_creates_then_resumes() {
        let f = fixture();
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());

        let first = f
            .reconciler
            .connect(user, map, Some(Position::new(1.0, 2.0)))
            .await
            .unwrap();
        assert!(!first.resumed);
        assert_eq!(f.presence.get(first.presence.session_id).await.unwrap().user_id, user);

        // Presence lapsed but the durable row is still active.
        f.presence.remove(first.presence.session_id).await.unwrap();
        let again = f.reconciler.connect(user, map, None).await.unwrap();
        assert!(again.resumed);
        assert_eq!(again.presence.session_id, first.presence.session_id);
        assert_eq!(again.presence.avatar_position, Position::new(1.0, 2.0));
    }

    #[tokio::test]
    async fn resume_drops_stale_current_poi() {
        let f = fixture();
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());
        let s = f.reconciler.connect(user, map, None).await.unwrap().presence.session_id;
        f.sessions.set_current_poi(s, Some(Uuid::new_v4())).await.unwrap();
        f.presence.remove(s).await.unwrap();

        let resumed = f.reconciler.connect(user, map, None).await.unwrap();
        assert_eq!(resumed.presence.current_poi, None);
        assert_eq!(f.sessions.get(s).await.unwrap().current_poi, None);
    }

    #[tokio::test]
    async fn resume_keeps_verified_membership() {
        let f = fixture();
        let (user, map, poi) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let s = f.reconciler.connect(user, map, None).await.unwrap().presence.session_id;
        f.membership.join(poi, s).await.unwrap();
        f.sessions.set_current_poi(s, Some(poi)).await.unwrap();
        f.presence.remove(s).await.unwrap();

        let resumed = f.reconciler.connect(user, map, None).await.unwrap();
        assert_eq!(resumed.presence.current_poi, Some(poi));
        assert_eq!(f.presence.get(s).await.unwrap().current_poi, Some(poi));
    }

    #[tokio::test]
    async fn disconnect_cleans_up_and_announces() {
        let f = fixture();
        let (user, map, poi) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let s = f.reconciler.connect(user, map, None).await.unwrap().presence.session_id;
        f.membership.join(poi, s).await.unwrap();
        let mut sub = f.events.open(Channel::Map(map)).await.unwrap();

        assert!(f.reconciler.disconnect(s).await.unwrap());
        assert!(!f.membership.is_member(poi, s).await.unwrap());
        assert!(f.presence.get(s).await.unwrap_err().is_not_found());
        assert!(!f.sessions.get(s).await.unwrap().is_active);

        let left = sub.next_envelope().await.unwrap().to_event().unwrap();
        assert!(matches!(left, DomainEvent::PoiLeft(e) if e.poi_id == poi && e.current_count == 0));
        let gone = sub.next_envelope().await.unwrap().to_event().unwrap();
        assert!(matches!(gone, DomainEvent::UserLeftMap(e) if e.session_id == s));

        assert!(!f.reconciler.disconnect(s).await.unwrap());
    }

    #[tokio::test]
    async fn move_avatar_updates_both_stores() {
        let f = fixture();
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());
        let s = f.reconciler.connect(user, map, None).await.unwrap().presence.session_id;
        let mut sub = f.events.open(Channel::Map(map)).await.unwrap();

        f.reconciler.move_avatar(s, Position::new(3.0, 4.0)).await.unwrap();
        assert_eq!(f.presence.get(s).await.unwrap().avatar_position, Position::new(3.0, 4.0));
        assert_eq!(f.sessions.get(s).await.unwrap().position, Position::new(3.0, 4.0));
        assert_eq!(sub.next_envelope().await.unwrap().event_type, "avatar_moved");

        let err = f.reconciler.move_avatar(s, Position::new(95.0, 0.0)).await.unwrap_err();
        assert!(matches!(err, crate::error::AppError::Validation(_)));
    }

    #[tokio::test]
    async fn expire_old_sessions_reaps_idle_rows() {
        let f = fixture();
        let (user, map, poi) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let s = f.reconciler.connect(user, map, None).await.unwrap().presence.session_id;
        f.membership.join(poi, s).await.unwrap();

        assert_eq!(f.reconciler.expire_old_sessions(Duration::from_secs(60)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.reconciler.expire_old_sessions(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(!f.membership.is_member(poi, s).await.unwrap());
        assert!(f.presence.get(s).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn roster_excludes_idle_sessions() {
        let f = fixture();
        let map = Uuid::new_v4();
        let live = f.reconciler.connect(Uuid::new_v4(), map, None).await.unwrap().presence;
        let idle = f.reconciler.connect(Uuid::new_v4(), map, None).await.unwrap().presence;
        f.presence
            .update_activity(idle.session_id, Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();

        let roster = f.reconciler.map_roster(map).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].session_id, live.session_id);
        assert!(!f.sessions.get(idle.session_id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn second_live_connect_conflicts() {
        let f = fixture();
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());
        let first = f.reconciler.connect(user, map, None).await.unwrap().presence;

        let err = f.reconciler.connect(user, map, None).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(f.presence.get(first.session_id).await.unwrap(), first);

        f.reconciler.disconnect(first.session_id).await.unwrap();
        let fresh = f.reconciler.connect(user, map, None).await.unwrap();
        assert!(!fresh.resumed);
        assert_ne!(fresh.presence.session_id, first.session_id);
    }

    async fn departures(sub: &mut crate::services::EventSubscription, session_id: Uuid) -> usize {
        let mut count = 0;
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(50), sub.next_envelope()).await
        {
            if matches!(envelope.to_event(), Ok(DomainEvent::UserLeftMap(e)) if e.session_id == session_id) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn lapsed_presence_departs_exactly_once() {
        let f = fixture();
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());
        let p = f.reconciler.connect(user, map, None).await.unwrap().presence;
        f.presence.set(&p, Duration::from_millis(30)).await.unwrap();
        let mut sub = f.events.open(Channel::Map(map)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(f.reconciler.expire_old_sessions(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(f.reconciler.map_roster(map).await.unwrap().is_empty());
        assert_eq!(departures(&mut sub, p.session_id).await, 1);
    }

    #[tokio::test]
    async fn roster_skips_sessions_that_already_departed() {
        let f = fixture();
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());
        let p = f.reconciler.connect(user, map, None).await.unwrap().presence;
        f.presence.set(&p, Duration::from_millis(30)).await.unwrap();
        f.sessions.deactivate(p.session_id).await.unwrap();
        let mut sub = f.events.open(Channel::Map(map)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(f.reconciler.map_roster(map).await.unwrap().is_empty());
        assert_eq!(departures(&mut sub, p.session_id).await, 0);
    }

    #[tokio::test]
    async fn presence_reads_survive_a_transient_failure() {
        let store = Arc::new(FaultyStore::default());
        let f = fixture_on(store.clone());
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());
        let s = f.reconciler.connect(user, map, None).await.unwrap().presence.session_id;

        store.fail_gets(1);
        f.reconciler.heartbeat(s).await.unwrap();
        store.fail_gets(1);
        f.reconciler.move_avatar(s, Position::new(5.0, 5.0)).await.unwrap();
        store.fail_gets(1);
        assert!(f.reconciler.disconnect(s).await.unwrap());
        assert!(!f.sessions.get(s).await.unwrap().is_active);
    }
}
