use anyhow::Result;
use chat_core::KeyValueStore;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-conversation "read up to here" timestamps kept in the client's key-value store.
///
/// Advancing is split in two: [`record`](Self::record) moves the in-memory
/// value and is cheap enough to call under the engine lock, while
/// [`persist`](Self::persist) writes it through to the store afterwards.
pub struct Watermarks {
    store: Arc<dyn KeyValueStore>,
    recorded: Mutex<HashMap<String, DateTime<Utc>>>,
    // serializes store writes so an older value never lands last
    writes: Mutex<()>,
}

impl Watermarks {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            recorded: Mutex::new(HashMap::new()),
            writes: Mutex::new(()),
        }
    }

    pub fn key(conversation_id: &str) -> String {
        format!("lastReadAt:{}", conversation_id)
    }

    pub fn get(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        if let Some(at) = self.recorded.lock().get(conversation_id) {
            return Some(*at);
        }
        self.stored(conversation_id)
    }

    fn stored(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        let raw = self.store.get(&Self::key(conversation_id))?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable watermark for {} ({}): {}",
                    conversation_id,
                    raw,
                    e
                );
                None
            }
        }
    }

    /// Move the in-memory watermark forward to `to` without touching the
    /// store. Never moves it back; returns the value in effect.
    pub fn record(&self, conversation_id: &str, to: DateTime<Utc>) -> DateTime<Utc> {
        let current = self.get(conversation_id);
        let effective = current.map_or(to, |current| current.max(to));
        self.recorded
            .lock()
            .insert(conversation_id.to_string(), effective);
        effective
    }

    /// Write the recorded watermark through to the store.
    pub fn persist(&self, conversation_id: &str) -> Result<()> {
        let _guard = self.writes.lock();
        let Some(at) = self.recorded.lock().get(conversation_id).copied() else {
            return Ok(());
        };
        if self.stored(conversation_id).map_or(false, |stored| stored >= at) {
            return Ok(());
        }
        self.store
            .set(&Self::key(conversation_id), &at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    /// Record and persist in one step.
    pub fn advance(&self, conversation_id: &str, to: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let effective = self.record(conversation_id, to);
        self.persist(conversation_id)?;
        Ok(effective)
    }
}

/// A message counts as unread when someone else sent it after the watermark.
/// Without a watermark every message from someone else is unread.
pub fn is_unread(message_sender: &str, created_at: DateTime<Utc>, user_id: &str, watermark: Option<DateTime<Utc>>) -> bool {
    message_sender != user_id && watermark.map_or(true, |w| created_at > w)
}
