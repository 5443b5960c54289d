//! Collaborators the sync engine is built on. Authentication, message
//! persistence and change fan-out live behind these traits so the engine can
//! run against Postgres/Redis in production and in-memory fakes in tests.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::types::{Identity, Message};

pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<Identity>;
}

/// Identity fixed at construction, e.g. from a verified session token.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(Option<Identity>);

impl StaticIdentity {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self(Some(Identity::new(user_id)))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<Identity> {
        self.0.clone()
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Full history of a conversation, ascending by creation time.
    async fn fetch(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// Persist a message and return the stored row with its canonical id and server timestamp.
    async fn insert(&self, conversation_id: &str, sender_id: &str, content: &str) -> Result<Message>;
}

pub type InsertCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Opaque token returned by [`ChangeNotifier::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    conversation_id: String,
}

impl SubscriptionHandle {
    pub fn new(id: u64, conversation_id: impl Into<String>) -> Self {
        Self {
            id,
            conversation_id: conversation_id.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

/// Insert notifications for a conversation. Delivery is at-least-once and not
/// necessarily ordered; a subscription may silently stop delivering.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn subscribe(&self, conversation_id: &str, on_insert: InsertCallback) -> Result<SubscriptionHandle>;

    /// Tearing down an unknown or already removed handle is a no-op.
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Client-scoped persistent string storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}
