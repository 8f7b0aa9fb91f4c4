//! POI orchestration: rate limit, durable record, membership, presence and
//! events for create/join/leave/update/delete.
//!
//! Mutations that pass the rate limiter hand back the caller's
//! [`RateLimitStatus`] alongside the result so the transport can emit
//! `x-ratelimit-*` headers.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::{PoiRepository, SessionRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    CreatePoiRequest, JoinOutcome, NewPoi, PoiCreated, PoiDeleted, PoiJoined, PoiLeft, PoiRecord,
    PoiSnapshot, PoiUpdate, PoiUpdated, RateAction, RateLimitStatus, SessionPresence,
};
use crate::services::events::EventFanout;
use crate::services::membership::MembershipRegistry;
use crate::services::presence::PresenceStore;
use crate::services::rate_limit::RateLimiter;
use crate::services::retry::RetryPolicy;

#[derive(Clone)]
pub struct PoiService {
    pois: Arc<dyn PoiRepository>,
    sessions: Arc<dyn SessionRepository>,
    presence: PresenceStore,
    membership: MembershipRegistry,
    events: EventFanout,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
}

impl PoiService {
    pub fn new(
        pois: Arc<dyn PoiRepository>,
        sessions: Arc<dyn SessionRepository>,
        presence: PresenceStore,
        membership: MembershipRegistry,
        events: EventFanout,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            pois,
            sessions,
            presence,
            membership,
            events,
            rate_limiter,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn live_presence(&self, session_id: Uuid) -> AppResult<SessionPresence> {
        self.retry
            .run("presence_get", move || self.presence.get(session_id))
            .await
    }

    /// Point both the presence entry and the durable row at `poi_id`.
    async fn record_current_poi(&self, session_id: Uuid, poi_id: Option<Uuid>) -> AppResult<()> {
        self.retry
            .run("presence_set_current_poi", move || {
                self.presence.set_current_poi(session_id, poi_id)
            })
            .await?;
        self.retry
            .run("session_set_current_poi", move || {
                self.sessions.set_current_poi(session_id, poi_id)
            })
            .await
    }

    #[instrument(skip(self, req))]
    pub async fn create_poi(
        &self,
        user_id: Uuid,
        map_id: Uuid,
        req: CreatePoiRequest,
    ) -> AppResult<(PoiRecord, RateLimitStatus)> {
        let rate = self
            .rate_limiter
            .check_rate_limit(&user_id.to_string(), RateAction::CreatePoi)
            .await?;
        req.validate()?;
        let poi = self
            .pois
            .create(NewPoi::from_request(map_id, user_id, req))
            .await?;
        info!(poi_id = %poi.id, "POI created");
        self.events
            .publish_poi_created(PoiCreated {
                poi_id: poi.id,
                map_id: poi.map_id,
                name: poi.name.clone(),
                position: poi.position,
                max_participants: poi.max_participants,
                created_by: poi.created_by,
                timestamp: poi.created_at,
            })
            .await?;
        Ok((poi, rate))
    }

    /// Join `poi_id`, leaving the session's previous POI once the new slot is
    /// secured. `AtCapacity` comes back as an outcome, not an error.
    ///
    /// A membership that the session's presence does not record yet is this
    /// call's own add (an attempt whose reply was lost), so it reports
    /// `Joined` and is announced once.
    #[instrument(skip(self))]
    pub async fn join_poi(
        &self,
        session_id: Uuid,
        poi_id: Uuid,
    ) -> AppResult<(JoinOutcome, RateLimitStatus)> {
        let presence = self.live_presence(session_id).await?;
        let rate = self
            .rate_limiter
            .check_rate_limit(&presence.user_id.to_string(), RateAction::JoinPoi)
            .await?;
        let poi = self
            .retry
            .run("get_poi", move || self.pois.get(poi_id))
            .await?;
        if poi.map_id != presence.map_id {
            return Err(AppError::Validation(format!(
                "POI {} is not on map {}",
                poi_id, presence.map_id
            )));
        }

        let max = u64::from(poi.max_participants);
        let joined = self
            .retry
            .run("poi_join", move || {
                self.membership.join_with_capacity_check(poi_id, session_id, max)
            })
            .await;
        let outcome = match joined {
            Ok(outcome) => outcome,
            // Unknown outcome: the add may have landed before the timeout.
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "join timed out, re-checking membership");
                let is_member = self
                    .retry
                    .run("poi_is_member", move || self.membership.is_member(poi_id, session_id))
                    .await?;
                if !is_member {
                    return Err(e);
                }
                JoinOutcome::AlreadyMember {
                    count: self
                        .retry
                        .run("poi_member_count", move || self.membership.count(poi_id))
                        .await?,
                }
            }
            Err(e) => return Err(e),
        };
        let outcome = match outcome {
            JoinOutcome::AlreadyMember { count } if presence.current_poi != Some(poi_id) => {
                JoinOutcome::Joined { count }
            }
            other => other,
        };
        if !outcome.is_member() {
            info!(count = outcome.count(), max, "POI at capacity");
            return Ok((outcome, rate));
        }

        if let Some(previous) = presence.current_poi.filter(|p| *p != poi_id) {
            self.leave_membership(&presence, previous).await?;
        }
        self.record_current_poi(session_id, Some(poi_id)).await?;

        if let JoinOutcome::Joined { count } = outcome {
            info!(count, "joined POI");
            self.events
                .publish_poi_joined(PoiJoined {
                    poi_id,
                    map_id: poi.map_id,
                    user_id: presence.user_id,
                    session_id,
                    current_count: count,
                    timestamp: Utc::now(),
                })
                .await?;
        }
        Ok((outcome, rate))
    }

    /// Idempotent. Returns whether the session was a member.
    #[instrument(skip(self))]
    pub async fn leave_poi(
        &self,
        session_id: Uuid,
        poi_id: Uuid,
    ) -> AppResult<(bool, RateLimitStatus)> {
        let presence = self.live_presence(session_id).await?;
        let rate = self
            .rate_limiter
            .check_rate_limit(&presence.user_id.to_string(), RateAction::LeavePoi)
            .await?;
        let was_member = self.leave_membership(&presence, poi_id).await?;
        if presence.current_poi == Some(poi_id) {
            self.record_current_poi(session_id, None).await?;
        }
        Ok((was_member, rate))
    }

    /// A lower `max_participants` applies to future joins only; nobody is evicted.
    #[instrument(skip(self, update))]
    pub async fn update_poi(
        &self,
        user_id: Uuid,
        poi_id: Uuid,
        update: PoiUpdate,
    ) -> AppResult<(PoiRecord, RateLimitStatus)> {
        let rate = self
            .rate_limiter
            .check_rate_limit(&user_id.to_string(), RateAction::UpdatePoi)
            .await?;
        update.validate()?;
        if update.is_empty() {
            return Err(AppError::Validation("nothing to update".to_string()));
        }
        let poi = self.pois.update(poi_id, &update).await?;
        self.events
            .publish_poi_updated(PoiUpdated {
                poi_id,
                map_id: poi.map_id,
                name: poi.name.clone(),
                description: poi.description.clone(),
                max_participants: poi.max_participants,
                timestamp: poi.updated_at,
            })
            .await?;
        Ok((poi, rate))
    }

    #[instrument(skip(self))]
    pub async fn delete_poi(&self, user_id: Uuid, poi_id: Uuid) -> AppResult<RateLimitStatus> {
        let rate = self
            .rate_limiter
            .check_rate_limit(&user_id.to_string(), RateAction::DeletePoi)
            .await?;
        let poi = self.pois.delete(poi_id).await?;
        let evicted = self.membership.remove_all_members(poi_id).await?;
        for &session_id in &evicted {
            match self
                .retry
                .run("presence_set_current_poi", move || {
                    self.presence.set_current_poi(session_id, None)
                })
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.sessions.clear_poi(poi_id).await?;
        info!(evicted = evicted.len(), "POI deleted");
        self.events
            .publish_poi_deleted(PoiDeleted {
                poi_id,
                map_id: poi.map_id,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(rate)
    }

    /// Record plus authoritative membership.
    pub async fn poi_snapshot(&self, poi_id: Uuid) -> AppResult<PoiSnapshot> {
        let poi = self.pois.get(poi_id).await?;
        self.snapshot(poi).await
    }

    pub async fn list_pois(&self, map_id: Uuid) -> AppResult<Vec<PoiSnapshot>> {
        let mut snapshots = Vec::new();
        for poi in self.pois.list_for_map(map_id).await? {
            snapshots.push(self.snapshot(poi).await?);
        }
        Ok(snapshots)
    }

    async fn snapshot(&self, poi: PoiRecord) -> AppResult<PoiSnapshot> {
        let participants = self.membership.members(poi.id).await?;
        Ok(PoiSnapshot {
            participant_count: participants.len() as u64,
            participants,
            poi,
        })
    }

    async fn leave_membership(&self, presence: &SessionPresence, poi_id: Uuid) -> AppResult<bool> {
        let session_id = presence.session_id;
        let removed = self
            .retry
            .run("poi_leave", move || self.membership.leave(poi_id, session_id))
            .await?;
        // A retried removal whose first reply was lost reports false; the
        // presence still naming the POI shows the membership was ours.
        if !removed && presence.current_poi != Some(poi_id) {
            return Ok(false);
        }
        let current_count = self
            .retry
            .run("poi_member_count", move || self.membership.count(poi_id))
            .await?;
        info!(poi_id = %poi_id, current_count, "left POI");
        self.events
            .publish_poi_left(PoiLeft {
                poi_id,
                map_id: presence.map_id,
                user_id: presence.user_id,
                session_id: presence.session_id,
                current_count,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryPoiRepository, MemorySessionRepository};
    use crate::models::{Channel, DomainEvent, Position, RateLimitExceeded};
    use crate::repositories::testing::FaultyStore;
    use crate::repositories::{EphemeralStore, MemoryStore};
    use crate::services::rate_limit::{RateLimit, SystemClock};
    use crate::services::session::SessionReconciler;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        pois: PoiService,
        reconciler: SessionReconciler,
        membership: MembershipRegistry,
        presence: PresenceStore,
        events: EventFanout,
    }

    fn fixture_with_limits(limits: HashMap<RateAction, RateLimit>) -> Fixture {
        fixture_on(Arc::new(MemoryStore::default()), limits)
    }

    fn fixture_on(store: Arc<dyn EphemeralStore>, limits: HashMap<RateAction, RateLimit>) -> Fixture {
        let retry = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        };
        let presence = PresenceStore::new(store.clone(), Duration::from_secs(60), Duration::from_secs(60));
        let membership = MembershipRegistry::new(store.clone());
        let events = EventFanout::new(store.clone());
        let limiter = RateLimiter::new(store, Arc::new(SystemClock), limits);
        let sessions: Arc<dyn SessionRepository> = Arc::new(MemorySessionRepository::new());
        let reconciler = SessionReconciler::new(
            presence.clone(),
            membership.clone(),
            events.clone(),
            limiter.clone(),
            sessions.clone(),
            Duration::from_secs(300),
        )
        .with_retry(retry);
        let pois = PoiService::new(
            Arc::new(MemoryPoiRepository::new()),
            sessions,
            presence.clone(),
            membership.clone(),
            events.clone(),
            limiter,
        )
        .with_retry(retry);
        Fixture {
            pois,
            reconciler,
            membership,
            presence,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_limits(HashMap::new())
    }

    fn request(lat: f64, max: u32) -> CreatePoiRequest {
        CreatePoiRequest {
            name: "Bench".to_string(),
            description: None,
            position: Position::new(lat, 0.0),
            max_participants: max,
        }
    }

    async fn session(f: &Fixture, map: Uuid) -> Uuid {
        f.reconciler
            .connect(Uuid::new_v4(), map, None)
            .await
            .unwrap()
            .presence
            .session_id
    }

    #[tokio::test]
    async fn join_moves_between_pois() {
        let f = fixture();
        let map = Uuid::new_v4();
        let (a, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 4)).await.unwrap();
        let (b, _) = f.pois.create_poi(Uuid::new_v4(), map, request(2.0, 4)).await.unwrap();
        let s = session(&f, map).await;

        let (outcome, _) = f.pois.join_poi(s, a.id).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Joined { count: 1 });
        let (outcome, _) = f.pois.join_poi(s, a.id).await.unwrap();
        assert_eq!(outcome, JoinOutcome::AlreadyMember { count: 1 });

        let mut sub = f.events.open(Channel::Map(map)).await.unwrap();
        f.pois.join_poi(s, b.id).await.unwrap();
        assert!(!f.membership.is_member(a.id, s).await.unwrap());
        assert_eq!(f.presence.get(s).await.unwrap().current_poi, Some(b.id));

        let left = sub.next_envelope().await.unwrap().to_event().unwrap();
        assert!(matches!(left, DomainEvent::PoiLeft(e) if e.poi_id == a.id));
        let joined = sub.next_envelope().await.unwrap().to_event().unwrap();
        assert!(matches!(joined, DomainEvent::PoiJoined(e) if e.poi_id == b.id && e.current_count == 1));
    }

    #[tokio::test]
    async fn full_poi_reports_capacity_without_side_effects() {
        let f = fixture();
        let map = Uuid::new_v4();
        let (poi, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 1)).await.unwrap();
        let first = session(&f, map).await;
        let second = session(&f, map).await;

        f.pois.join_poi(first, poi.id).await.unwrap();
        let (outcome, _) = f.pois.join_poi(second, poi.id).await.unwrap();
        assert_eq!(outcome, JoinOutcome::AtCapacity { count: 1, max: 1 });
        assert_eq!(f.presence.get(second).await.unwrap().current_poi, None);
    }

    #[tokio::test]
    async fn join_rejects_poi_from_other_map() {
        let f = fixture();
        let (poi, _) = f
            .pois
            .create_poi(Uuid::new_v4(), Uuid::new_v4(), request(1.0, 4))
            .await
            .unwrap();
        let s = session(&f, Uuid::new_v4()).await;
        assert!(matches!(f.pois.join_poi(s, poi.id).await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn lowering_capacity_keeps_members() {
        let f = fixture();
        let map = Uuid::new_v4();
        let (poi, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 3)).await.unwrap();
        let (a, b, c) = (session(&f, map).await, session(&f, map).await, session(&f, map).await);
        f.pois.join_poi(a, poi.id).await.unwrap();
        f.pois.join_poi(b, poi.id).await.unwrap();

        let update = PoiUpdate {
            max_participants: Some(1),
            ..Default::default()
        };
        f.pois.update_poi(Uuid::new_v4(), poi.id, update).await.unwrap();
        assert_eq!(f.membership.count(poi.id).await.unwrap(), 2);
        let (outcome, _) = f.pois.join_poi(c, poi.id).await.unwrap();
        assert_eq!(outcome, JoinOutcome::AtCapacity { count: 2, max: 1 });
    }

    #[tokio::test]
    async fn delete_evicts_members() {
        let f = fixture();
        let map = Uuid::new_v4();
        let (poi, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 3)).await.unwrap();
        let s = session(&f, map).await;
        f.pois.join_poi(s, poi.id).await.unwrap();

        f.pois.delete_poi(Uuid::new_v4(), poi.id).await.unwrap();
        assert_eq!(f.membership.count(poi.id).await.unwrap(), 0);
        assert_eq!(f.presence.get(s).await.unwrap().current_poi, None);
        assert!(f.pois.poi_snapshot(poi.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn create_is_rate_limited() {
        let limits = HashMap::from([(
            RateAction::CreatePoi,
            RateLimit::new(1, Duration::from_secs(3600)),
        )]);
        let f = fixture_with_limits(limits);
        let (user, map) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, rate) = f.pois.create_poi(user, map, request(1.0, 2)).await.unwrap();
        assert_eq!(rate.remaining, 0);

        let err = f.pois.create_poi(user, map, request(5.0, 2)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::RateLimited(RateLimitExceeded { limit: 1, .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_lists_participants() {
        let f = fixture();
        let map = Uuid::new_v4();
        let (poi, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 3)).await.unwrap();
        let s = session(&f, map).await;
        f.pois.join_poi(s, poi.id).await.unwrap();

        let snapshot = f.pois.poi_snapshot(poi.id).await.unwrap();
        assert_eq!(snapshot.participant_count, 1);
        assert_eq!(snapshot.participants, vec![s]);
        assert_eq!(f.pois.list_pois(map).await.unwrap().len(), 1);

        let (was_member, _) = f.pois.leave_poi(s, poi.id).await.unwrap();
        assert!(was_member);
        let (was_member, _) = f.pois.leave_poi(s, poi.id).await.unwrap();
        assert!(!was_member);
    }

    async fn joins_announced(sub: &mut crate::services::EventSubscription, poi_id: Uuid) -> usize {
        let mut count = 0;
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(50), sub.next_envelope()).await
        {
            if matches!(envelope.to_event(), Ok(DomainEvent::PoiJoined(e)) if e.poi_id == poi_id) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn timed_out_join_is_resolved_from_membership() {
        let store = Arc::new(FaultyStore::default());
        let f = fixture_on(store.clone(), HashMap::new());
        let map = Uuid::new_v4();
        let (poi, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 4)).await.unwrap();
        let s = session(&f, map).await;
        let mut sub = f.events.open(Channel::Map(map)).await.unwrap();

        store.time_out_after_capped_add();
        let (outcome, _) = f.pois.join_poi(s, poi.id).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Joined { count: 1 });
        assert_eq!(f.presence.get(s).await.unwrap().current_poi, Some(poi.id));

        let (outcome, _) = f.pois.join_poi(s, poi.id).await.unwrap();
        assert_eq!(outcome, JoinOutcome::AlreadyMember { count: 1 });
        assert_eq!(joins_announced(&mut sub, poi.id).await, 1);
    }

    #[tokio::test]
    async fn timed_out_join_that_never_landed_is_an_error() {
        let store = Arc::new(FaultyStore::default());
        let f = fixture_on(store.clone(), HashMap::new());
        let map = Uuid::new_v4();
        let (poi, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 1)).await.unwrap();
        let (first, second) = (session(&f, map).await, session(&f, map).await);
        f.pois.join_poi(first, poi.id).await.unwrap();

        // Full, so the add never lands and there is nothing to recover.
        store.time_out_after_capped_add();
        let err = f.pois.join_poi(second, poi.id).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!f.membership.is_member(poi.id, second).await.unwrap());
    }

    #[tokio::test]
    async fn join_and_leave_survive_transient_reads() {
        let store = Arc::new(FaultyStore::default());
        let f = fixture_on(store.clone(), HashMap::new());
        let map = Uuid::new_v4();
        let (poi, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 4)).await.unwrap();
        let s = session(&f, map).await;

        store.fail_gets(1);
        let (outcome, _) = f.pois.join_poi(s, poi.id).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Joined { count: 1 });
        store.fail_gets(1);
        let (was_member, _) = f.pois.leave_poi(s, poi.id).await.unwrap();
        assert!(was_member);
        assert_eq!(f.presence.get(s).await.unwrap().current_poi, None);
    }

    #[tokio::test]
    async fn whitespace_names_are_rejected() {
        let f = fixture();
        let map = Uuid::new_v4();
        let mut req = request(1.0, 4);
        req.name = "   ".to_string();
        assert!(matches!(
            f.pois.create_poi(Uuid::new_v4(), map, req).await,
            Err(AppError::Validation(_))
        ));

        let (poi, _) = f.pois.create_poi(Uuid::new_v4(), map, request(1.0, 4)).await.unwrap();
        let update = PoiUpdate {
            name: Some("\t ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            f.pois.update_poi(Uuid::new_v4(), poi.id, update).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(f.pois.poi_snapshot(poi.id).await.unwrap().poi.name, "Bench");
    }
}
