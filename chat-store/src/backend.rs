use anyhow::Result;
use chat_core::{BackendKind, ChangeNotifier, Config, MessageStore, SyncContext};
use std::sync::Arc;
use tracing;

use crate::db::create_pool as create_db_pool;
use crate::memory::InMemoryBackend;
use crate::postgres::PgMessageStore;
use crate::redis::create_pool as create_redis_pool;
use crate::stream::RedisChangeNotifier;

/// Build the shared context for the configured backend.
pub async fn connect(config: Config) -> Result<SyncContext> {
    let (store, notifier): (Arc<dyn MessageStore>, Arc<dyn ChangeNotifier>) = match config.sync.backend {
        BackendKind::Postgres => {
            let db_pool = create_db_pool(&config.database).await?;
            let redis_pool = create_redis_pool(&config.redis).await?;
            let store: Arc<dyn MessageStore> =
                Arc::new(PgMessageStore::new(db_pool).with_publisher(redis_pool.clone()));
            let notifier: Arc<dyn ChangeNotifier> = Arc::new(RedisChangeNotifier::new(redis_pool));
            (store, notifier)
        }
        BackendKind::Memory => {
            tracing::warn!("Using the in-memory backend; messages are lost on restart");
            let backend = Arc::new(InMemoryBackend::new());
            let store: Arc<dyn MessageStore> = backend.clone();
            let notifier: Arc<dyn ChangeNotifier> = backend;
            (store, notifier)
        }
    };

    Ok(SyncContext::new(config, store, notifier))
}
