//! Entry point: load config, wire dependencies, and run the server.

use mapmeet::config::{Config, StorageMode};
use mapmeet::db::{self, PoiRepository, SessionRepository};
use mapmeet::repositories::{EphemeralStore, MemoryStore, RedisStore};
use mapmeet::services::SystemClock;
use mapmeet::{create_app, AppState};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (store, sessions, pois): (
        Arc<dyn EphemeralStore>,
        Arc<dyn SessionRepository>,
        Arc<dyn PoiRepository>,
    ) = match config.storage_mode {
        StorageMode::Redis => {
            let db_pool = db::create_pool(&config.database_url).await?;
            db::run_migrations(&db_pool).await?;
            let store = RedisStore::connect(&config.redis_url, config.store_op_timeout).await?;
            (
                Arc::new(store),
                Arc::new(db::PgSessionRepository::new(db_pool.clone())),
                Arc::new(db::PgPoiRepository::new(db_pool)),
            )
        }
        StorageMode::Memory => {
            tracing::warn!("STORAGE_MODE=memory: state is process-local and lost on restart");
            (
                Arc::new(MemoryStore::default()),
                Arc::new(db::MemorySessionRepository::new()),
                Arc::new(db::MemoryPoiRepository::new()),
            )
        }
    };

    let state = AppState::new(store, sessions, pois, Arc::new(SystemClock), &config);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let sweeper = state.reconciler.spawn_sweeper(config.sweep_interval, async move {
        let _ = stop_rx.changed().await;
    });

    let app = create_app(state).layer(CorsLayer::permissive());

    tracing::info!(addr = %config.server_addr, mode = ?config.storage_mode, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = stop_tx.send(true);
    let _ = sweeper.await;
    Ok(())
}
