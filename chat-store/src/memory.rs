use anyhow::Result;
use async_trait::async_trait;
use chat_core::{ChangeNotifier, InsertCallback, KeyValueStore, Message, MessageStore, SubscriptionHandle};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct BackendState {
    messages: HashMap<String, Vec<Message>>,
    subscribers: HashMap<u64, (String, InsertCallback)>,
    next_handle: u64,
}

/// Process-local message store and notifier. Inserts fan out to the
/// conversation's subscribers before `insert` returns.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .filter(|(id, _)| id == conversation_id)
            .count()
    }
}

#[async_trait]
impl MessageStore for InMemoryBackend {
    async fn fetch(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let state = self.state.lock();
        let mut rows = state
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn insert(&self, conversation_id: &str, sender_id: &str, content: &str) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };

        let callbacks: Vec<InsertCallback> = {
            let mut state = self.state.lock();
            state
                .messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
            state
                .subscribers
                .values()
                .filter(|(id, _)| id == conversation_id)
                .map(|(_, callback)| callback.clone())
                .collect()
        };

        // outside the lock: callbacks may call back into the store
        for callback in callbacks {
            callback(message.clone());
        }

        Ok(message)
    }
}

#[async_trait]
impl ChangeNotifier for InMemoryBackend {
    async fn subscribe(&self, conversation_id: &str, on_insert: InsertCallback) -> Result<SubscriptionHandle> {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let id = state.next_handle;
        state
            .subscribers
            .insert(id, (conversation_id.to_string(), on_insert));
        Ok(SubscriptionHandle::new(id, conversation_id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.state.lock().subscribers.remove(&handle.id());
    }
}

#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_insert_notifies_conversation_subscribers() {
        let backend = InMemoryBackend::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        let handle = backend
            .subscribe("m1", Arc::new(move |m: Message| sink.lock().push(m.id)))
            .await
            .unwrap();
        let other = Arc::new(Mutex::new(0usize));
        let counter = other.clone();
        backend
            .subscribe("m2", Arc::new(move |_m: Message| *counter.lock() += 1))
            .await
            .unwrap();

        let stored = backend.insert("m1", "recruiter-1", "hello").await.unwrap();
        assert_eq!(*received.lock(), vec![stored.id.clone()]);
        assert_eq!(*other.lock(), 0);

        backend.unsubscribe(handle.clone()).await;
        backend.unsubscribe(handle).await;
        backend.insert("m1", "recruiter-1", "again").await.unwrap();
        assert_eq!(received.lock().len(), 1);
        assert_eq!(backend.subscriber_count("m1"), 0);

        let history = backend.fetch("m1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
    }

    #[test]
    fn test_key_value_roundtrip() {
        let kv = InMemoryKeyValueStore::new();
        assert_eq!(kv.get("k"), None);
        kv.set("k", "v").unwrap();
        assert_eq!(kv.get("k").as_deref(), Some("v"));
    }
}
