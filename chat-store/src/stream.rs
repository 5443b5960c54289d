//! Insert fan-out over Redis streams, one stream per conversation.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chat_core::{ChangeNotifier, InsertCallback, Message, SubscriptionHandle};
use parking_lot::Mutex;
use redis::streams::{StreamRangeReply, StreamReadReply};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing;

use crate::redis::{get_connection, RedisConnection, RedisPool};

const STREAM_MAX_LEN: usize = 1000;
const BLOCK_MS: usize = 1000;

pub fn stream_key(conversation_id: &str) -> String {
    format!("STREAM:MESSAGES:{}", conversation_id)
}

pub async fn publish_insert(pool: &RedisPool, message: &Message) -> Result<()> {
    let payload = serde_json::to_string(message)?;
    let mut conn = get_connection(pool).await?;

    let _: String = redis::cmd("XADD")
        .arg(stream_key(&message.conversation_id))
        .arg("MAXLEN")
        .arg("~")
        .arg(STREAM_MAX_LEN)
        .arg("*")
        .arg("data")
        .arg(payload)
        .query_async(&mut conn)
        .await?;

    Ok(())
}

/// Follows conversation streams with blocking `XREAD`, one task and one
/// connection per subscription.
pub struct RedisChangeNotifier {
    pool: RedisPool,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl RedisChangeNotifier {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.tasks.lock().len()
    }
}

#[async_trait]
impl ChangeNotifier for RedisChangeNotifier {
    async fn subscribe(&self, conversation_id: &str, on_insert: InsertCallback) -> Result<SubscriptionHandle> {
        let key = stream_key(conversation_id);
        let mut conn = get_connection(&self.pool).await?;

        // Anchor at the newest entry so everything published from now on is delivered.
        let latest: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(&key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to read stream {}: {}", key, e))?;
        let start = latest
            .ids
            .first()
            .map(|entry| entry.id.clone())
            .unwrap_or_else(|| "0".to_string());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Following {} from {}", key, start);
        let task = tokio::spawn(follow_stream(self.pool.clone(), key, start, Some(conn), on_insert));
        self.tasks.lock().insert(id, task);

        Ok(SubscriptionHandle::new(id, conversation_id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(task) = self.tasks.lock().remove(&handle.id()) {
            task.abort();
            tracing::debug!("Stopped following {}", stream_key(handle.conversation_id()));
        }
    }
}

impl Drop for RedisChangeNotifier {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

async fn follow_stream(
    pool: RedisPool,
    key: String,
    mut last_id: String,
    mut conn: Option<RedisConnection>,
    on_insert: InsertCallback,
) {
    loop {
        if conn.is_none() {
            match get_connection(&pool).await {
                Ok(c) => conn = Some(c),
                Err(e) => {
                    tracing::warn!("Reconnect for {} failed: {}", key, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }
        }
        let Some(active) = conn.as_mut() else {
            continue;
        };

        let reply: redis::RedisResult<Option<StreamReadReply>> = redis::cmd("XREAD")
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(&key)
            .arg(&last_id)
            .query_async(active)
            .await;

        match reply {
            Ok(Some(reply)) => {
                for stream in reply.keys {
                    for entry in stream.ids {
                        last_id = entry.id.clone();
                        match entry.get::<String>("data") {
                            Some(data) => match serde_json::from_str::<Message>(&data) {
                                Ok(message) => on_insert(message),
                                Err(e) => tracing::warn!("Skipping malformed entry {} on {}: {}", entry.id, key, e),
                            },
                            None => tracing::warn!("Entry {} on {} has no data field", entry.id, key),
                        }
                    }
                }
            }
            // block timed out without new entries
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Stream read error on {}: {}", key, e);
                conn = None;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key() {
        assert_eq!(stream_key("m1"), "STREAM:MESSAGES:m1");
    }
}
