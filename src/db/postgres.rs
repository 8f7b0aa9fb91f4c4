//! PostgreSQL repositories. Schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{poi_not_found, session_not_found, too_close, DbPool, PoiRepository, SessionRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    NewPoi, NewSession, PoiRecord, PoiUpdate, Position, SessionRecord, MIN_POI_SPACING_METERS,
};

const SESSION_COLUMNS: &str =
    "id, user_id, map_id, lat, lng, current_poi, is_active, last_active, created_at";

const POI_COLUMNS: &str =
    "id, map_id, name, description, lat, lng, max_participants, created_by, created_at, updated_at";

// Great-circle distance in meters between the row and ($2, $3).
const NEARBY_POI: &str = r#"
    SELECT id FROM pois
    WHERE map_id = $1
      AND 2 * 6371000 * asin(sqrt(
            power(sin(radians(lat - $2) / 2), 2)
            + cos(radians($2)) * cos(radians(lat)) * power(sin(radians(lng - $3) / 2), 2)
          )) < $4
    LIMIT 1
"#;

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    map_id: Uuid,
    lat: f64,
    lng: f64,
    current_poi: Option<Uuid>,
    is_active: bool,
    last_active: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        SessionRecord {
            id: row.id,
            user_id: row.user_id,
            map_id: row.map_id,
            position: Position::new(row.lat, row.lng),
            current_poi: row.current_poi,
            is_active: row.is_active,
            last_active: row.last_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct PoiRow {
    id: Uuid,
    map_id: Uuid,
    name: String,
    description: Option<String>,
    lat: f64,
    lng: f64,
    max_participants: i32,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PoiRow> for PoiRecord {
    fn from(row: PoiRow) -> Self {
        PoiRecord {
            id: row.id,
            map_id: row.map_id,
            name: row.name,
            description: row.description,
            position: Position::new(row.lat, row.lng),
            max_participants: row.max_participants.max(0) as u32,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn participants_column(max: u32) -> i32 {
    max.min(i32::MAX as u32) as i32
}

#[derive(Clone)]
pub struct PgSessionRepository {
    pool: DbPool,
}

impl PgSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn find_active(&self, user_id: Uuid, map_id: Uuid) -> AppResult<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM sessions WHERE user_id = $1 AND map_id = $2 AND is_active",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(map_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn create(&self, new: NewSession) -> AppResult<SessionRecord> {
        let result = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            INSERT INTO sessions (id, user_id, map_id, lat, lng)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.map_id)
        .bind(new.position.lat)
        .bind(new.position.lng)
        .fetch_one(&self.pool)
        .await;
        match result {
            Ok(row) => {
                debug!(session_id = %row.id, "session row created");
                Ok(row.into())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::Conflict(
                "user already has an active session on this map".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, session_id: Uuid) -> AppResult<SessionRecord> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into)
        .ok_or_else(|| session_not_found(session_id))
    }

    async fn touch(
        &self,
        session_id: Uuid,
        at: DateTime<Utc>,
        position: Option<Position>,
    ) -> AppResult<()> {
        let r = sqlx::query(
            r#"
            UPDATE sessions
            SET last_active = GREATEST(last_active, $2),
                lat = COALESCE($3, lat),
                lng = COALESCE($4, lng)
            WHERE id = $1 AND is_active
            "#,
        )
        .bind(session_id)
        .bind(at)
        .bind(position.map(|p| p.lat))
        .bind(position.map(|p| p.lng))
        .execute(&self.pool)
        .await?;
        if r.rows_affected() == 0 {
            return Err(session_not_found(session_id));
        }
        Ok(())
    }

    async fn set_current_poi(&self, session_id: Uuid, poi_id: Option<Uuid>) -> AppResult<()> {
        let r = sqlx::query("UPDATE sessions SET current_poi = $2 WHERE id = $1")
            .bind(session_id)
            .bind(poi_id)
            .execute(&self.pool)
            .await?;
        if r.rows_affected() == 0 {
            return Err(session_not_found(session_id));
        }
        Ok(())
    }

    async fn clear_poi(&self, poi_id: Uuid) -> AppResult<u64> {
        let r = sqlx::query("UPDATE sessions SET current_poi = NULL WHERE current_poi = $1")
            .bind(poi_id)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }

    async fn deactivate(&self, session_id: Uuid) -> AppResult<bool> {
        let r = sqlx::query(
            "UPDATE sessions SET is_active = FALSE, current_poi = NULL WHERE id = $1 AND is_active",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected() > 0)
    }

    async fn expire_inactive(&self, timeout: Duration) -> AppResult<Vec<SessionRecord>> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::zero());
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE sessions SET is_active = FALSE
            WHERE is_active AND last_active < $1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        if !rows.is_empty() {
            info!(count = rows.len(), "expired inactive session rows");
        }
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Clone)]
pub struct PgPoiRepository {
    pool: DbPool,
}

impl PgPoiRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PoiRepository for PgPoiRepository {
    async fn create(&self, new: NewPoi) -> AppResult<PoiRecord> {
        let mut tx = self.pool.begin().await?;
        // Serialize creates per map so the proximity check cannot race.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(new.map_id)
            .execute(&mut *tx)
            .await?;
        let nearby: Option<(Uuid,)> = sqlx::query_as(NEARBY_POI)
            .bind(new.map_id)
            .bind(new.position.lat)
            .bind(new.position.lng)
            .bind(MIN_POI_SPACING_METERS)
            .fetch_optional(&mut *tx)
            .await?;
        if nearby.is_some() {
            return Err(too_close());
        }
        let row = sqlx::query_as::<_, PoiRow>(&format!(
            r#"
            INSERT INTO pois (id, map_id, name, description, lat, lng, max_participants, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            POI_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.map_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.position.lat)
        .bind(new.position.lng)
        .bind(participants_column(new.max_participants))
        .bind(new.created_by)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row.into())
    }

    async fn get(&self, poi_id: Uuid) -> AppResult<PoiRecord> {
        sqlx::query_as::<_, PoiRow>(&format!("SELECT {} FROM pois WHERE id = $1", POI_COLUMNS))
            .bind(poi_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or_else(|| poi_not_found(poi_id))
    }

    async fn update(&self, poi_id: Uuid, update: &PoiUpdate) -> AppResult<PoiRecord> {
        sqlx::query_as::<_, PoiRow>(&format!(
            r#"
            UPDATE pois
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                max_participants = COALESCE($4, max_participants),
                updated_at = now()
            WHERE id = $1
            RETURNING {}
            "#,
            POI_COLUMNS
        ))
        .bind(poi_id)
        .bind(update.name.as_deref().map(str::trim))
        .bind(update.description.as_deref())
        .bind(update.max_participants.map(participants_column))
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into)
        .ok_or_else(|| poi_not_found(poi_id))
    }

    async fn delete(&self, poi_id: Uuid) -> AppResult<PoiRecord> {
        sqlx::query_as::<_, PoiRow>(&format!(
            "DELETE FROM pois WHERE id = $1 RETURNING {}",
            POI_COLUMNS
        ))
        .bind(poi_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into)
        .ok_or_else(|| poi_not_found(poi_id))
    }

    async fn list_for_map(&self, map_id: Uuid) -> AppResult<Vec<PoiRecord>> {
        let rows = sqlx::query_as::<_, PoiRow>(&format!(
            "SELECT {} FROM pois WHERE map_id = $1 ORDER BY created_at",
            POI_COLUMNS
        ))
        .bind(map_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
