//! Presence and POI coordination for shared live maps.
//!
//! Tracks who is on a map, where their avatar is and which point of interest
//! they occupy, with capacity-checked joins, per-map event streams over
//! Redis pub/sub and rate limiting on every mutation.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use services::{PoiService, SessionReconciler};

use axum::routing::{get, post};
use handlers::http;
use tower_http::trace::TraceLayer;

/// Build the API router (ws, presence, POIs, health). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    let map_routes = axum::Router::new()
        .route("/:map_id/presence", get(http::map_presence))
        .route("/:map_id/pois", get(http::list_pois).post(http::create_poi));

    let poi_routes = axum::Router::new()
        .route(
            "/:poi_id",
            get(http::get_poi)
                .patch(http::update_poi)
                .delete(http::delete_poi),
        )
        .route("/:poi_id/join", post(http::join_poi))
        .route("/:poi_id/leave", post(http::leave_poi));

    axum::Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/health", get(http::health))
        .nest("/maps", map_routes)
        .nest("/pois", poi_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
