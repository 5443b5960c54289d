use anyhow::{anyhow, Result};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use std::sync::Arc;
use tokio::time::Duration;
use tracing;

use chat_core::config::DatabaseConfig;

use crate::url::mask_credentials;

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the message database pool. Postgres often comes up after us in
/// compose setups, so the first checkout is retried with exponential backoff.
pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!("Connecting to message database at {}", mask_credentials(&config.url));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    let mut attempt = 1;
    loop {
        match try_checkout(&pool).await {
            Ok(()) => {
                tracing::info!("Message database ready ({} connections max)", config.max_connections);
                return Ok(Arc::new(pool));
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                let backoff = Duration::from_secs(1 << (attempt - 1));
                tracing::warn!(
                    "Database not reachable (attempt {}/{}): {}; retrying in {:?}",
                    attempt,
                    CONNECT_ATTEMPTS,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("Giving up on the message database after {} attempts", attempt);
                return Err(e);
            }
        }
    }
}

async fn try_checkout(pool: &DbPool) -> Result<()> {
    match tokio::time::timeout(CONNECT_TIMEOUT, pool.get()).await {
        Ok(Ok(_conn)) => Ok(()),
        Ok(Err(e)) => Err(anyhow!("Database connection failed: {}", e)),
        Err(_) => Err(anyhow!("Database connection timed out after {:?}", CONNECT_TIMEOUT)),
    }
}

pub async fn get_connection(pool: &DbPool) -> Result<DbConnection> {
    pool.get()
        .await
        .map_err(|e| anyhow!("Failed to get database connection: {}", e))
}
