#![forbid(unsafe_code)]

// Database module - optional PostgreSQL pool for durable state

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const POOL_MAX_CONNECTIONS: u32 = 20;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// Connect and migrate if a URL is configured. Without one the server runs
/// purely in memory and every caller sees `None`.
pub async fn connect(database_url: Option<&str>) -> anyhow::Result<Option<PgPool>> {
    let Some(url) = database_url else {
        info!("DATABASE_URL not set, running with in-memory state only");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
        .connect(url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("PostgreSQL connected, migrations applied");

    Ok(Some(pool))
}
