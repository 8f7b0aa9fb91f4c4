//! HTTP handlers: presence roster, POI CRUD and membership, health.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{PoiRepository, SessionRepository};
use crate::error::{rate_limit_headers, AppError, AppResult};
use crate::middleware::ClientIdentity;
use crate::models::{CreatePoiRequest, JoinOutcome, PoiUpdate};
use crate::repositories::EphemeralStore;
use crate::services::{
    Clock, EventFanout, MembershipRegistry, PoiService, PresenceStore, RateLimiter,
    SessionReconciler,
};

/// Shared application state for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub presence: PresenceStore,
    pub membership: MembershipRegistry,
    pub events: EventFanout,
    pub rate_limiter: RateLimiter,
    pub reconciler: SessionReconciler,
    pub pois: PoiService,
    /// Outbound event buffer per WebSocket connection.
    pub event_buffer: usize,
}

impl AppState {
    /// Wire every service over one ephemeral store and the durable repositories.
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        sessions: Arc<dyn SessionRepository>,
        pois: Arc<dyn PoiRepository>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let presence = PresenceStore::new(store.clone(), config.presence_ttl, config.session_timeout);
        let membership = MembershipRegistry::new(store.clone());
        let retry = config.store_retry;
        let events = EventFanout::new(store.clone()).with_retry(retry);
        let rate_limiter = RateLimiter::new(store, clock, config.rate_limits.clone());
        let reconciler = SessionReconciler::new(
            presence.clone(),
            membership.clone(),
            events.clone(),
            rate_limiter.clone(),
            sessions.clone(),
            config.session_timeout,
        )
        .with_retry(retry);
        let pois = PoiService::new(
            pois,
            sessions,
            presence.clone(),
            membership.clone(),
            events.clone(),
            rate_limiter.clone(),
        )
        .with_retry(retry);
        Self {
            presence,
            membership,
            events,
            rate_limiter,
            reconciler,
            pois,
            event_buffer: config.event_buffer,
        }
    }

    /// Fails unless the session is live and belongs to `identity`.
    pub async fn ensure_owner(&self, identity: ClientIdentity, session_id: Uuid) -> AppResult<()> {
        let presence = self.presence.get(session_id).await?;
        if presence.user_id != identity.0 {
            return Err(AppError::Auth(
                "session belongs to another user".to_string(),
            ));
        }
        Ok(())
    }
}

/// Body of `POST /pois/:poi_id/join` and `/leave`.
#[derive(Debug, Deserialize)]
pub struct SessionRef {
    pub session_id: Uuid,
}

/// GET /maps/:map_id/presence
pub async fn map_presence(
    State(state): State<AppState>,
    Path(map_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let roster = state.reconciler.map_roster(map_id).await?;
    Ok(Json(json!({ "map_id": map_id, "count": roster.len(), "sessions": roster })))
}

/// GET /maps/:map_id/pois
pub async fn list_pois(
    State(state): State<AppState>,
    Path(map_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(state.pois.list_pois(map_id).await?))
}

/// POST /maps/:map_id/pois
pub async fn create_poi(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Path(map_id): Path<Uuid>,
    Json(body): Json<CreatePoiRequest>,
) -> AppResult<impl IntoResponse> {
    let (poi, rate) = state.pois.create_poi(identity.0, map_id, body).await?;
    Ok((StatusCode::CREATED, rate_limit_headers(&rate), Json(poi)))
}

/// GET /pois/:poi_id
pub async fn get_poi(
    State(state): State<AppState>,
    Path(poi_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(state.pois.poi_snapshot(poi_id).await?))
}

/// PATCH /pois/:poi_id
pub async fn update_poi(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Path(poi_id): Path<Uuid>,
    Json(body): Json<PoiUpdate>,
) -> AppResult<impl IntoResponse> {
    let (poi, rate) = state.pois.update_poi(identity.0, poi_id, body).await?;
    Ok((rate_limit_headers(&rate), Json(poi)))
}

/// DELETE /pois/:poi_id
pub async fn delete_poi(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Path(poi_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let rate = state.pois.delete_poi(identity.0, poi_id).await?;
    Ok((StatusCode::NO_CONTENT, rate_limit_headers(&rate)))
}

/// POST /pois/:poi_id/join. 409 `at_capacity` when the POI is full.
pub async fn join_poi(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Path(poi_id): Path<Uuid>,
    Json(body): Json<SessionRef>,
) -> AppResult<impl IntoResponse> {
    state.ensure_owner(identity, body.session_id).await?;
    let (outcome, rate) = state.pois.join_poi(body.session_id, poi_id).await?;
    if let JoinOutcome::AtCapacity { max, .. } = outcome {
        return Err(AppError::AtCapacity { poi_id, max });
    }
    Ok((rate_limit_headers(&rate), Json(outcome)))
}

/// POST /pois/:poi_id/leave
pub async fn leave_poi(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Path(poi_id): Path<Uuid>,
    Json(body): Json<SessionRef>,
) -> AppResult<impl IntoResponse> {
    state.ensure_owner(identity, body.session_id).await?;
    let (was_member, rate) = state.pois.leave_poi(body.session_id, poi_id).await?;
    Ok((
        rate_limit_headers(&rate),
        Json(json!({ "poi_id": poi_id, "left": was_member })),
    ))
}

/// GET /health: liveness check.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "mapmeet" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryPoiRepository, MemorySessionRepository};
    use crate::repositories::testing::FaultyStore;
    use crate::services::{RetryPolicy, SystemClock};
    use std::collections::HashMap;
    use std::time::Duration;

    fn state_on(store: Arc<FaultyStore>, attempts: u32) -> AppState {
        let config = Config {
            store_retry: RetryPolicy {
                attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            rate_limits: HashMap::new(),
            ..Config::default()
        };
        AppState::new(
            store,
            Arc::new(MemorySessionRepository::new()),
            Arc::new(MemoryPoiRepository::new()),
            Arc::new(SystemClock),
            &config,
        )
    }

    #[tokio::test]
    async fn configured_retry_reaches_the_services() {
        let store = Arc::new(FaultyStore::default());
        let state = state_on(store.clone(), 2);
        let s = state
            .reconciler
            .connect(Uuid::new_v4(), Uuid::new_v4(), None)
            .await
            .unwrap()
            .presence
            .session_id;
        store.fail_gets(1);
        state.reconciler.heartbeat(s).await.unwrap();

        let store = Arc::new(FaultyStore::default());
        let state = state_on(store.clone(), 1);
        let s = state
            .reconciler
            .connect(Uuid::new_v4(), Uuid::new_v4(), None)
            .await
            .unwrap()
            .presence
            .session_id;
        store.fail_gets(1);
        assert!(state.reconciler.heartbeat(s).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn ensure_owner_checks_the_session_user() {
        let state = state_on(Arc::new(FaultyStore::default()), 1);
        let user = Uuid::new_v4();
        let s = state
            .reconciler
            .connect(user, Uuid::new_v4(), None)
            .await
            .unwrap()
            .presence
            .session_id;
        assert!(state.ensure_owner(ClientIdentity(user), s).await.is_ok());
        assert!(matches!(
            state.ensure_owner(ClientIdentity(Uuid::new_v4()), s).await,
            Err(AppError::Auth(_))
        ));
    }
}
