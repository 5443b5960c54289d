use anyhow::{anyhow, Result};
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::sync::Arc;
use tracing;

use chat_core::config::RedisConfig;

use crate::url::mask_credentials;

pub type RedisPool = Arc<Client>;
pub type RedisConnection = MultiplexedConnection;

pub async fn create_pool(config: &RedisConfig) -> Result<RedisPool> {
    tracing::info!("Connecting to change stream Redis at {}", mask_credentials(&config.url));

    let client = Client::open(config.url.as_str())
        .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Failed to connect to Redis: {}", e))?;

    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| anyhow!("Failed to ping Redis: {}", e))?;

    tracing::info!("Change stream Redis ready");

    Ok(Arc::new(client))
}

pub async fn get_connection(pool: &RedisPool) -> Result<RedisConnection> {
    pool.get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))
}
