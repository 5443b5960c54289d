use anyhow::{Context, Result};
use chat_core::{StaticIdentity, SyncContext};
use chat_store::FileKeyValueStore;
use chat_sync::ConversationSyncEngine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing;

use crate::auth::AuthenticatedUser;

/// One sync engine per signed-in (user, device) pair, created on first use.
/// Each session persists its read watermarks in its own file under the
/// configured watermark directory.
pub struct SessionRegistry {
    ctx: SyncContext,
    sessions: Mutex<HashMap<(String, String), ConversationSyncEngine>>,
}

impl SessionRegistry {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine_for(&self, user: &AuthenticatedUser) -> Result<ConversationSyncEngine> {
        let key = (user.user_id.clone(), user.device_id.clone());
        let mut sessions = self.sessions.lock();
        if let Some(engine) = sessions.get(&key) {
            return Ok(engine.clone());
        }

        let path = self.watermark_path(user);
        let watermarks = FileKeyValueStore::open(&path)
            .with_context(|| format!("Failed to open watermarks for {}", user.user_id))?;
        let engine = ConversationSyncEngine::from_context(
            &self.ctx,
            Arc::new(StaticIdentity::signed_in(user.user_id.clone())),
            Arc::new(watermarks),
        );

        tracing::info!(
            "Started sync session for {} on {} ({})",
            user.user_id,
            user.device_id,
            path.display()
        );
        sessions.insert(key, engine.clone());
        Ok(engine)
    }

    /// Drop sessions with nothing open or tracked that no request or socket
    /// is still using. Their watermarks are on disk, so a later request
    /// starts a fresh engine from the same file. Returns how many were dropped.
    pub fn prune_idle(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        // only the registry's own handle left
        sessions.retain(|_, engine| engine.handle_count() > 1 || !engine.is_idle());
        let pruned = before - sessions.len();
        if pruned > 0 {
            tracing::debug!("Dropped {} idle sync sessions, {} remain", pruned, sessions.len());
        }
        pruned
    }

    pub fn engines(&self) -> Vec<ConversationSyncEngine> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Tear down every session's subscriptions.
    pub async fn shutdown(&self) {
        let engines: Vec<ConversationSyncEngine> =
            self.sessions.lock().drain().map(|(_, engine)| engine).collect();
        for engine in engines {
            engine.shutdown().await;
        }
    }

    fn watermark_path(&self, user: &AuthenticatedUser) -> PathBuf {
        self.ctx.config.sync.watermark_dir.join(format!(
            "{}-{}.json",
            file_safe(&user.user_id),
            user.device_id
        ))
    }
}

fn file_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::Config;
    use chat_store::InMemoryBackend;

    fn registry(dir: &std::path::Path) -> SessionRegistry {
        let mut config = Config::from_env();
        config.sync.watermark_dir = dir.to_path_buf();
        let backend = Arc::new(InMemoryBackend::new());
        SessionRegistry::new(SyncContext::new(config, backend.clone(), backend))
    }

    fn user(id: &str, device: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: id.to_string(),
            device_id: device.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sessions_are_per_user_and_device() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let laptop = registry.engine_for(&user("recruiter-1", "laptop")).unwrap();
        laptop.open("m1").await.unwrap();

        let again = registry.engine_for(&user("recruiter-1", "laptop")).unwrap();
        assert!(again.messages("m1").is_some());

        let phone = registry.engine_for(&user("recruiter-1", "phone")).unwrap();
        assert!(phone.messages("m1").is_none());
        assert_eq!(registry.len(), 2);

        registry.shutdown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_idle_sessions_are_dropped_after_last_close() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let laptop = user("recruiter-1", "laptop");

        let engine = registry.engine_for(&laptop).unwrap();
        engine.open("m1").await.unwrap();
        drop(engine);
        assert_eq!(registry.prune_idle(), 0);

        let engine = registry.engine_for(&laptop).unwrap();
        engine.close("m1").await;
        // still held by the caller
        assert_eq!(registry.prune_idle(), 0);
        drop(engine);
        assert_eq!(registry.prune_idle(), 1);
        assert!(registry.is_empty());

        // read state survives the session being dropped
        let stored = FileKeyValueStore::open(dir.path().join("recruiter-1-laptop.json")).unwrap();
        assert!(chat_core::KeyValueStore::get(&stored, "lastReadAt:m1").is_some());
        let engine = registry.engine_for(&laptop).unwrap();
        assert!(engine.messages("m1").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_watermarks_land_in_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let engine = registry.engine_for(&user("user@example.com", "default")).unwrap();
        engine.mark_read("m1").unwrap();

        let path = dir.path().join("user_example_com-default.json");
        let stored = FileKeyValueStore::open(&path).unwrap();
        assert!(chat_core::KeyValueStore::get(&stored, "lastReadAt:m1").is_some());
    }
}
