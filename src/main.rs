#![forbid(unsafe_code)]

use anyhow::Result;
use squawk::config::ServerConfig;
use squawk::identity::IdentityPool;
use squawk::metrics::ServerMetrics;
use squawk::room::RoomRegistry;
use squawk::signaling::SignalingServer;
use squawk::{db, store};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "squawk=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Squawk - Starting server");

    let config = ServerConfig::from_env();
    let port = config.port;

    let metrics = ServerMetrics::new();

    // Connect to database (optional)
    let db_pool = db::connect(config.database_url.as_deref()).await?;

    // Rehydrate the identity pool from a previous run, then top it up
    let identities = match &db_pool {
        Some(pool) => IdentityPool::from_entries(store::load_identities(pool).await?),
        None => IdentityPool::new(),
    };
    let (minted, _total) = identities.provision(config.meeting_id_pool);
    if !minted.is_empty() {
        store::save_new_identities(db_pool.as_ref(), &minted).await;
    }

    let registry = RoomRegistry::new(config.room_count, config.room_capacity, metrics.clone());

    // Membership never survives a restart; the mirrored rows must not either
    store::clear_participants(db_pool.as_ref()).await;
    store::ensure_rooms(db_pool.as_ref(), &registry.list().await).await;

    let server = SignalingServer::new(config, registry, identities, metrics, db_pool);

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
