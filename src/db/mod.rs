//! Durable store: session and POI records behind repository traits, with a
//! PostgreSQL implementation and an in-memory one.

mod memory;
mod pool;
mod postgres;

pub use memory::{MemoryPoiRepository, MemorySessionRepository};
pub use pool::{create_pool, run_migrations, DbPool};
pub use postgres::{PgPoiRepository, PgSessionRepository};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{NewPoi, NewSession, PoiRecord, PoiUpdate, Position, SessionRecord};

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// The active session for this user on this map, if any.
    async fn find_active(&self, user_id: Uuid, map_id: Uuid) -> AppResult<Option<SessionRecord>>;

    /// Fails with `Conflict` when the user already has an active session on the map.
    async fn create(&self, new: NewSession) -> AppResult<SessionRecord>;

    async fn get(&self, session_id: Uuid) -> AppResult<SessionRecord>;

    /// Bump `last_active`, and the position when given.
    async fn touch(
        &self,
        session_id: Uuid,
        at: DateTime<Utc>,
        position: Option<Position>,
    ) -> AppResult<()>;

    async fn set_current_poi(&self, session_id: Uuid, poi_id: Option<Uuid>) -> AppResult<()>;

    /// Clear `current_poi` on every session pointing at the POI.
    async fn clear_poi(&self, poi_id: Uuid) -> AppResult<u64>;

    /// Returns false when the session was already inactive or missing.
    async fn deactivate(&self, session_id: Uuid) -> AppResult<bool>;

    /// Mark every active session idle for longer than `timeout` inactive and
    /// return them.
    async fn expire_inactive(&self, timeout: Duration) -> AppResult<Vec<SessionRecord>>;
}

#[async_trait]
pub trait PoiRepository: Send + Sync {
    /// Fails with `Conflict` when another POI on the map lies within
    /// [`crate::models::MIN_POI_SPACING_METERS`].
    async fn create(&self, new: NewPoi) -> AppResult<PoiRecord>;

    async fn get(&self, poi_id: Uuid) -> AppResult<PoiRecord>;

    async fn update(&self, poi_id: Uuid, update: &PoiUpdate) -> AppResult<PoiRecord>;

    /// Returns the deleted record.
    async fn delete(&self, poi_id: Uuid) -> AppResult<PoiRecord>;

    async fn list_for_map(&self, map_id: Uuid) -> AppResult<Vec<PoiRecord>>;
}

fn session_not_found(session_id: Uuid) -> crate::error::AppError {
    crate::error::AppError::NotFound(format!("session {} not found", session_id))
}

fn poi_not_found(poi_id: Uuid) -> crate::error::AppError {
    crate::error::AppError::NotFound(format!("POI {} not found", poi_id))
}

fn too_close() -> crate::error::AppError {
    crate::error::AppError::Conflict(format!(
        "another POI exists within {} meters",
        crate::models::MIN_POI_SPACING_METERS
    ))
}
