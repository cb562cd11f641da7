//! Till Sync Server - reference origin for the till sync engine.
//!
//! Serves the collection REST API the engine's HTTP origin speaks:
//! full snapshots on `GET /api/{collection}`, creates, partial updates and
//! deletes, all wrapped in the `{success, data, error}` envelope. Payloads
//! are validated against the same schema the till uses.

mod auth;
mod config;
mod db;
mod error;
mod handlers;
mod routes;

use crate::config::Config;
use crate::db::Pool;
use axum::Router;
use std::sync::Arc;
use till_sync_engine::Schema;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub schema: Arc<Schema>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "till_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        address = %config.bind_address(),
        auth = config.auth_secret.is_some(),
        "starting till sync server"
    );

    let pool = db::create_pool(&config.database_url, config.max_connections).await?;

    tracing::info!("running database migrations");
    db::run_migrations(&pool).await?;

    let addr = config.bind_address();
    let state = AppState {
        pool,
        config: Arc::new(config),
        schema: Arc::new(Schema::pos()),
    };

    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
