//! Controllable stand-ins for the message store, change notifier and
//! client key-value store.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chat_core::{
    ChangeNotifier, InsertCallback, KeyValueStore, Message, MessageStore, StaticIdentity,
    SubscriptionHandle,
};
use chat_sync::ConversationSyncEngine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const RECRUITER: &str = "recruiter-1";
pub const CANDIDATE: &str = "candidate-7";

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct FakeState {
    history: HashMap<String, Vec<Message>>,
    subscribers: HashMap<u64, (String, InsertCallback)>,
    next_handle: u64,
    next_row: u64,
    confirm_as: Option<(String, DateTime<Utc>)>,
    before_insert: Option<Hook>,
    subscribe_calls: usize,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    pub fail_inserts: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub fail_fetch: AtomicBool,
    /// Deliver the insert notification before the insert call returns.
    pub echo_before_confirm: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a row without notifying anyone, as if the live channel missed it.
    pub fn seed(&self, message: Message) {
        let mut state = self.state.lock();
        state
            .history
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    /// Store a row and notify subscribers.
    pub fn push_remote(&self, message: Message) {
        self.seed(message.clone());
        self.deliver(message);
    }

    /// Notify subscribers only, e.g. a redelivery.
    pub fn deliver(&self, message: Message) {
        let callbacks: Vec<InsertCallback> = {
            let state = self.state.lock();
            state
                .subscribers
                .values()
                .filter(|(conversation_id, _)| *conversation_id == message.conversation_id)
                .map(|(_, callback)| callback.clone())
                .collect()
        };
        for callback in callbacks {
            callback(message.clone());
        }
    }

    pub fn active_subscriptions(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .filter(|(id, _)| id == conversation_id)
            .count()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn confirm_next_as(&self, id: &str, created_at: DateTime<Utc>) {
        self.state.lock().confirm_as = Some((id.to_string(), created_at));
    }

    pub fn before_next_insert(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().before_insert = Some(Box::new(hook));
    }

    pub fn stored(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .history
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for FakeBackend {
    async fn fetch(&self, conversation_id: &str) -> Result<Vec<Message>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        let mut rows = self.stored(conversation_id);
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn insert(&self, conversation_id: &str, sender_id: &str, content: &str) -> Result<Message> {
        let hook = self.state.lock().before_insert.take();
        if let Some(hook) = hook {
            hook();
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(anyhow!("permission denied for table messages"));
        }

        let stored = {
            let mut state = self.state.lock();
            state.next_row += 1;
            let (id, created_at) = state
                .confirm_as
                .take()
                .unwrap_or_else(|| (format!("msg-{}", state.next_row), Utc::now()));
            let stored = Message {
                id,
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                content: content.to_string(),
                created_at,
            };
            state
                .history
                .entry(conversation_id.to_string())
                .or_default()
                .push(stored.clone());
            stored
        };

        if self.echo_before_confirm.load(Ordering::SeqCst) {
            self.deliver(stored.clone());
        }
        Ok(stored)
    }
}

#[async_trait]
impl ChangeNotifier for FakeBackend {
    async fn subscribe(&self, conversation_id: &str, on_insert: InsertCallback) -> Result<SubscriptionHandle> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(anyhow!("channel rejected"));
        }
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
pub struct MapStore(Mutex<HashMap<String, String>>);

impl KeyValueStore for MapStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.0.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub engine: ConversationSyncEngine,
    pub backend: Arc<FakeBackend>,
    pub kv: Arc<MapStore>,
}

pub fn harness() -> Harness {
    harness_as(StaticIdentity::signed_in(RECRUITER))
}

pub fn harness_as(identity: StaticIdentity) -> Harness {
    let backend = FakeBackend::new();
    let kv = Arc::new(MapStore::default());
    let engine = ConversationSyncEngine::new(
        Arc::new(identity),
        backend.clone(),
        backend.clone(),
        kv.clone(),
    );
    Harness { engine, backend, kv }
}

pub fn message(id: &str, conversation_id: &str, sender_id: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: format!("content of {}", id),
        created_at,
    }
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}
