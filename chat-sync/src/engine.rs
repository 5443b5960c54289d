use chat_core::{
    ChangeNotifier, Identity, IdentityProvider, InsertCallback, KeyValueStore, Message, MessageStore,
    SubscriptionHandle, SyncContext, SyncError, SyncResult, UnreadCounts, TEMP_ID_PREFIX,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing;

use crate::cache::MessageCache;
use crate::view::ConversationView;
use crate::watermark::{is_unread, Watermarks};

/// Keeps per-conversation message caches and unread counts consistent with a
/// remote message store, given at-least-once insert notifications.
///
/// A conversation is in scope while it is open (viewed) or tracked for an
/// unread badge. Each in-scope conversation holds exactly one subscription,
/// shared by both uses.
#[derive(Clone)]
pub struct ConversationSyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn ChangeNotifier>,
    watermarks: Watermarks,
    conversations: Mutex<HashMap<String, ConversationState>>,
    generations: AtomicU64,
    temp_sequence: AtomicU64,
}

#[derive(Default)]
struct ConversationState {
    view: Option<ViewState>,
    unread: Option<UnreadState>,
    subscription: Option<ActiveSubscription>,
}

impl ConversationState {
    fn in_scope(&self) -> bool {
        self.view.is_some() || self.unread.is_some()
    }
}

struct ViewState {
    cache: MessageCache,
    updates: watch::Sender<Vec<Message>>,
}

impl ViewState {
    fn new() -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            cache: MessageCache::new(),
            updates,
        }
    }

    fn publish(&self) {
        self.updates.send_replace(self.cache.messages().to_vec());
    }
}

#[derive(Default)]
struct UnreadState {
    // ids instead of a counter so redelivered inserts are not counted twice
    ids: HashSet<String>,
    counted: bool,
}

struct ActiveSubscription {
    generation: u64,
    // None while the subscribe call is still in flight
    handle: Option<SubscriptionHandle>,
}

impl ConversationSyncEngine {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn ChangeNotifier>,
        watermarks: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                store,
                notifier,
                watermarks: Watermarks::new(watermarks),
                conversations: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
                temp_sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_context(
        ctx: &SyncContext,
        identity: Arc<dyn IdentityProvider>,
        watermarks: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::new(identity, ctx.store.clone(), ctx.notifier.clone(), watermarks)
    }

    /// Open a conversation for viewing: subscribe to its inserts (replacing
    /// any earlier subscription), load its history and mark it read.
    ///
    /// When the subscription cannot be established the fetched history is
    /// still cached and available through [`messages`](Self::messages), and
    /// `SubscriptionFailed` is returned; calling `open` again retries.
    pub async fn open(&self, conversation_id: &str) -> SyncResult<ConversationView> {
        self.require_user()?;
        validate_conversation_id(conversation_id)?;

        let updates = {
            let mut conversations = self.inner.conversations.lock();
            let state = conversations.entry(conversation_id.to_string()).or_default();
            state.view.get_or_insert_with(ViewState::new).updates.subscribe()
        };

        // Subscribe before fetching so nothing committed in between is missed;
        // the merge rule absorbs rows seen through both paths.
        let subscribed = self.ensure_subscription(conversation_id, true).await;
        let history = self.inner.store.fetch(conversation_id).await;

        if let Ok(rows) = &history {
            let mut conversations = self.inner.conversations.lock();
            if let Some(view) = conversations
                .get_mut(conversation_id)
                .and_then(|state| state.view.as_mut())
            {
                view.cache.merge_all(rows.iter().cloned());
                view.publish();
            }
        }

        if let Err(e) = self.mark_read(conversation_id) {
            tracing::warn!("Opened {} but could not persist read state: {}", conversation_id, e);
        }

        let history = history.map_err(SyncError::FetchFailed)?;
        if let Err(e) = subscribed {
            tracing::warn!(
                "Conversation {} opened without live updates: {}",
                conversation_id,
                e
            );
            return Err(e);
        }

        tracing::info!(
            "Opened conversation {} with {} stored messages",
            conversation_id,
            history.len()
        );

        Ok(ConversationView::new(conversation_id, updates))
    }

    /// Stop viewing a conversation. Idempotent.
    pub async fn close(&self, conversation_id: &str) {
        let released = {
            let mut conversations = self.inner.conversations.lock();
            match conversations.get_mut(conversation_id) {
                Some(state) => {
                    state.view = None;
                    release_if_idle(&mut conversations, conversation_id)
                }
                None => None,
            }
        };

        if let Some(handle) = released {
            self.inner.notifier.unsubscribe(handle).await;
            tracing::info!("Closed conversation {}", conversation_id);
        }
    }

    /// Send a message with an optimistic local entry.
    ///
    /// The temporary entry is visible immediately; on success it is replaced
    /// by the stored row, on failure it is removed and `SendFailed` returned.
    pub async fn send(&self, conversation_id: &str, text: &str) -> SyncResult<Message> {
        let user = self.require_user()?;
        let content = text.trim();
        if content.is_empty() {
            return Err(SyncError::InvalidArgument("message text is empty".to_string()));
        }

        let pending = Message {
            id: self.next_temp_id(),
            conversation_id: conversation_id.to_string(),
            sender_id: user.id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
        };

        {
            let mut conversations = self.inner.conversations.lock();
            let view = conversations
                .get_mut(conversation_id)
                .and_then(|state| state.view.as_mut())
                .ok_or_else(|| {
                    SyncError::InvalidArgument(format!("conversation {} is not open", conversation_id))
                })?;
            view.cache.insert_pending(pending.clone());
            view.publish();
        }

        let result = self
            .inner
            .store
            .insert(conversation_id, &user.id, content)
            .await;

        {
            let mut conversations = self.inner.conversations.lock();
            if let Some(view) = conversations
                .get_mut(conversation_id)
                .and_then(|state| state.view.as_mut())
            {
                view.cache.remove(&pending.id);
                if let Ok(stored) = &result {
                    // the live echo may already have merged this row
                    view.cache.merge(stored.clone());
                }
                view.publish();
            }
        }

        match result {
            Ok(stored) => {
                tracing::debug!("Message {} confirmed in {}", stored.id, conversation_id);
                Ok(stored)
            }
            Err(e) => {
                tracing::warn!("Send to {} failed, rolled back {}: {}", conversation_id, pending.id, e);
                Err(SyncError::SendFailed(e))
            }
        }
    }

    /// Set the conversation's watermark to now and zero its unread count.
    pub fn mark_read(&self, conversation_id: &str) -> SyncResult<()> {
        let read_to = {
            let mut conversations = self.inner.conversations.lock();
            let state = conversations.get_mut(conversation_id);

            let mut read_to = Utc::now();
            if let Some(newest) = state
                .as_ref()
                .and_then(|s| s.view.as_ref())
                .and_then(|v| v.cache.messages().last())
            {
                // server clocks can run ahead of ours
                read_to = read_to.max(newest.created_at);
            }

            if let Some(unread) = state.and_then(|s| s.unread.as_mut()) {
                unread.ids.clear();
            }
            self.inner.watermarks.record(conversation_id, read_to)
        };

        // file-backed stores write synchronously, so keep it off the lock
        self.inner
            .watermarks
            .persist(conversation_id)
            .map_err(SyncError::StorageFailed)?;
        tracing::debug!("Marked {} read up to {}", conversation_id, read_to);
        Ok(())
    }

    /// Unread counts for the given conversations, plus their total.
    ///
    /// Conversations seen for the first time are counted from the store and
    /// subscribed to; afterwards their counts move with live inserts.
    /// Conversations tracked earlier but missing from `conversation_ids` stop
    /// being tracked.
    pub async fn unread_counts(&self, conversation_ids: &[String]) -> SyncResult<UnreadCounts> {
        let user = self.require_user()?;
        for id in conversation_ids {
            validate_conversation_id(id)?;
        }
        let wanted: HashSet<&str> = conversation_ids.iter().map(String::as_str).collect();

        let (released, to_count) = {
            let mut conversations = self.inner.conversations.lock();

            let dropped: Vec<String> = conversations
                .iter()
                .filter(|(id, state)| state.unread.is_some() && !wanted.contains(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect();
            let mut released = Vec::new();
            for id in dropped {
                if let Some(state) = conversations.get_mut(&id) {
                    state.unread = None;
                }
                if let Some(handle) = release_if_idle(&mut conversations, &id) {
                    released.push(handle);
                }
            }

            let mut to_count = Vec::new();
            for id in conversation_ids {
                let state = conversations.entry(id.clone()).or_default();
                let unread = state.unread.get_or_insert_with(UnreadState::default);
                if !unread.counted && !to_count.contains(id) {
                    to_count.push(id.clone());
                }
            }

            (released, to_count)
        };

        for handle in released {
            tracing::debug!("No longer tracking unread for {}", handle.conversation_id());
            self.inner.notifier.unsubscribe(handle).await;
        }

        futures::future::join_all(to_count.iter().map(|id| self.count_unread(id, &user))).await;

        Ok(self.unread_for(conversation_ids))
    }

    /// Current unread counts of every tracked conversation, without any I/O.
    pub fn unread_snapshot(&self) -> UnreadCounts {
        let conversations = self.inner.conversations.lock();
        let counts: BTreeMap<String, usize> = conversations
            .iter()
            .filter_map(|(id, state)| state.unread.as_ref().map(|u| (id.clone(), u.ids.len())))
            .collect();
        UnreadCounts::from_counts(counts)
    }

    pub fn unread_count(&self, conversation_id: &str) -> usize {
        self.inner
            .conversations
            .lock()
            .get(conversation_id)
            .and_then(|state| state.unread.as_ref())
            .map_or(0, |unread| unread.ids.len())
    }

    /// Last known messages of an open conversation.
    pub fn messages(&self, conversation_id: &str) -> Option<Vec<Message>> {
        self.inner
            .conversations
            .lock()
            .get(conversation_id)
            .and_then(|state| state.view.as_ref())
            .map(|view| view.cache.messages().to_vec())
    }

    /// Attach another observer to an already open conversation.
    pub fn watch(&self, conversation_id: &str) -> Option<ConversationView> {
        self.inner
            .conversations
            .lock()
            .get(conversation_id)
            .and_then(|state| state.view.as_ref())
            .map(|view| ConversationView::new(conversation_id, view.updates.subscribe()))
    }

    /// True when no conversation is open or tracked.
    pub fn is_idle(&self) -> bool {
        self.inner
            .conversations
            .lock()
            .values()
            .all(|state| !state.in_scope())
    }

    /// Number of live handles to this engine, including `self`.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.inner
            .conversations
            .lock()
            .get(conversation_id)
            .and_then(|state| state.subscription.as_ref())
            .map_or(false, |sub| sub.handle.is_some())
    }

    /// Re-fetch an in-scope conversation and merge whatever the live channel
    /// missed. Re-establishes a missing subscription first.
    ///
    /// Returns how many messages were new to the cache, or for a conversation
    /// that is only tracked, how many new unread messages were found.
    pub async fn reconcile(&self, conversation_id: &str) -> SyncResult<usize> {
        let user = self.require_user()?;
        let in_scope = self
            .inner
            .conversations
            .lock()
            .get(conversation_id)
            .map_or(false, ConversationState::in_scope);
        if !in_scope {
            return Err(SyncError::InvalidArgument(format!(
                "conversation {} is neither open nor tracked",
                conversation_id
            )));
        }

        if let Err(e) = self.ensure_subscription(conversation_id, false).await {
            tracing::warn!("Resubscribe of {} failed during reconciliation: {}", conversation_id, e);
        }

        let history = self
            .inner
            .store
            .fetch(conversation_id)
            .await
            .map_err(SyncError::FetchFailed)?;

        let mut conversations = self.inner.conversations.lock();
        let Some(state) = conversations.get_mut(conversation_id) else {
            return Ok(0);
        };

        if let Some(view) = state.view.as_mut() {
            let added = view.cache.merge_all(history);
            if added == 0 {
                return Ok(0);
            }
            view.publish();
            tracing::info!("Reconciled {} missed messages into {}", added, conversation_id);

            // recovered rows are on screen, so they are read like live arrivals
            let newest = view.cache.messages().last().map(|m| m.created_at);
            let read_to = newest.map_or_else(Utc::now, |at| Utc::now().max(at));
            self.inner.watermarks.record(conversation_id, read_to);
            if let Some(unread) = state.unread.as_mut() {
                unread.ids.clear();
            }
            drop(conversations);

            if let Err(e) = self.inner.watermarks.persist(conversation_id) {
                tracing::warn!("Failed to advance watermark for {}: {}", conversation_id, e);
            }
            return Ok(added);
        }

        let watermark = self.inner.watermarks.get(conversation_id);
        let Some(unread) = state.unread.as_mut() else {
            return Ok(0);
        };
        let before = unread.ids.len();
        unread.ids.extend(
            history
                .into_iter()
                .filter(|m| is_unread(&m.sender_id, m.created_at, &user.id, watermark))
                .map(|m| m.id),
        );
        unread.counted = true;
        Ok(unread.ids.len() - before)
    }

    /// Reconcile every in-scope conversation. Failures are logged and skipped.
    pub async fn reconcile_all(&self) -> usize {
        let ids: Vec<String> = self
            .inner
            .conversations
            .lock()
            .iter()
            .filter(|(_, state)| state.in_scope())
            .map(|(id, _)| id.clone())
            .collect();

        let mut total = 0;
        for id in ids {
            match self.reconcile(&id).await {
                Ok(found) => total += found,
                Err(e) => tracing::warn!("Reconciliation of {} failed: {}", id, e),
            }
        }
        total
    }

    /// Tear down every subscription and forget all conversations.
    pub async fn shutdown(&self) {
        let handles: Vec<SubscriptionHandle> = self
            .inner
            .conversations
            .lock()
            .drain()
            .filter_map(|(_, state)| state.subscription.and_then(|sub| sub.handle))
            .collect();

        for handle in handles {
            self.inner.notifier.unsubscribe(handle).await;
        }
    }

    fn require_user(&self) -> SyncResult<Identity> {
        self.inner
            .identity
            .current_user()
            .ok_or(SyncError::Unauthenticated)
    }

    fn next_temp_id(&self) -> String {
        format!(
            "{}{}-{}",
            TEMP_ID_PREFIX,
            Utc::now().timestamp_millis(),
            self.inner.temp_sequence.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Make sure the conversation has a live subscription. With `replace`,
    /// any existing one is torn down and a fresh one installed.
    async fn ensure_subscription(&self, conversation_id: &str, replace: bool) -> SyncResult<()> {
        let (generation, previous) = {
            let mut conversations = self.inner.conversations.lock();
            let Some(state) = conversations.get_mut(conversation_id) else {
                return Ok(());
            };
            if !replace && state.subscription.is_some() {
                return Ok(());
            }
            let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
            let previous = state.subscription.replace(ActiveSubscription {
                generation,
                handle: None,
            });
            (generation, previous.and_then(|sub| sub.handle))
        };

        if let Some(handle) = previous {
            tracing::debug!("Replacing subscription for {}", conversation_id);
            self.inner.notifier.unsubscribe(handle).await;
        }

        let callback = self.insert_callback(conversation_id, generation);
        match self.inner.notifier.subscribe(conversation_id, callback).await {
            Ok(handle) => {
                let stale = {
                    let mut conversations = self.inner.conversations.lock();
                    match conversations
                        .get_mut(conversation_id)
                        .filter(|state| state.in_scope())
                        .and_then(|state| state.subscription.as_mut())
                        .filter(|sub| sub.generation == generation)
                    {
                        Some(sub) => {
                            sub.handle = Some(handle);
                            None
                        }
                        None => Some(handle),
                    }
                };

                match stale {
                    // superseded by a later open, or closed meanwhile
                    Some(handle) => {
                        tracing::debug!("Discarding superseded subscription for {}", conversation_id);
                        self.inner.notifier.unsubscribe(handle).await;
                    }
                    None => tracing::info!("Subscribed to inserts for {}", conversation_id),
                }
                Ok(())
            }
            Err(e) => {
                let mut conversations = self.inner.conversations.lock();
                if let Some(state) = conversations.get_mut(conversation_id) {
                    if state
                        .subscription
                        .as_ref()
                        .map_or(false, |sub| sub.generation == generation)
                    {
                        state.subscription = None;
                    }
                }
                tracing::error!("Subscription for {} failed: {}", conversation_id, e);
                Err(SyncError::SubscriptionFailed(e))
            }
        }
    }

    fn insert_callback(&self, conversation_id: &str, generation: u64) -> InsertCallback {
        let inner = Arc::downgrade(&self.inner);
        let conversation_id = conversation_id.to_string();
        Arc::new(move |message: Message| {
            if let Some(inner) = inner.upgrade() {
                inner.apply_insert(&conversation_id, generation, message);
            }
        })
    }

    async fn count_unread(&self, conversation_id: &str, user: &Identity) {
        let subscribed = self.ensure_subscription(conversation_id, false).await;
        if let Err(e) = &subscribed {
            tracing::warn!("Unread badge for {} will not update live: {}", conversation_id, e);
        }

        let history = match self.inner.store.fetch(conversation_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!("Failed to count unread messages for {}: {}", conversation_id, e);
                return;
            }
        };

        let mut conversations = self.inner.conversations.lock();
        let Some(state) = conversations.get_mut(conversation_id) else {
            return;
        };
        let viewing = state.view.is_some();
        let Some(unread) = state.unread.as_mut() else {
            return;
        };
        if !viewing {
            // evaluated under the lock so a concurrent mark_read is respected
            let watermark = self.inner.watermarks.get(conversation_id);
            unread.ids.extend(
                history
                    .into_iter()
                    .filter(|m| is_unread(&m.sender_id, m.created_at, &user.id, watermark))
                    .map(|m| m.id),
            );
        }
        // retried on the next call when live updates are not flowing
        unread.counted = subscribed.is_ok();
        tracing::debug!("{} has {} unread messages", conversation_id, unread.ids.len());
    }

    fn unread_for(&self, conversation_ids: &[String]) -> UnreadCounts {
        let conversations = self.inner.conversations.lock();
        let counts: BTreeMap<String, usize> = conversation_ids
            .iter()
            .map(|id| {
                let count = conversations
                    .get(id)
                    .and_then(|state| state.unread.as_ref())
                    .map_or(0, |unread| unread.ids.len());
                (id.clone(), count)
            })
            .collect();
        UnreadCounts::from_counts(counts)
    }
}

impl Inner {
    /// Live insert handler. Runs on the notifier's delivery path.
    fn apply_insert(&self, conversation_id: &str, generation: u64, message: Message) {
        if message.conversation_id != conversation_id {
            tracing::debug!(
                "Ignoring message {} for {} delivered on {}",
                message.id,
                message.conversation_id,
                conversation_id
            );
            return;
        }
        if message.is_temporary() {
            return;
        }

        let user = self.identity.current_user();
        let mut conversations = self.conversations.lock();
        let Some(state) = conversations.get_mut(conversation_id) else {
            return;
        };
        if state.subscription.as_ref().map(|sub| sub.generation) != Some(generation) {
            tracing::debug!("Dropping delivery from a replaced subscription on {}", conversation_id);
            return;
        }

        if let Some(view) = state.view.as_mut() {
            if view.cache.merge(message.clone()) {
                view.publish();
            }
            // in view means read as soon as it arrives
            self.watermarks
                .record(conversation_id, Utc::now().max(message.created_at));
            if let Some(unread) = state.unread.as_mut() {
                unread.ids.clear();
            }
            drop(conversations);

            if let Err(e) = self.watermarks.persist(conversation_id) {
                tracing::warn!("Failed to advance watermark for {}: {}", conversation_id, e);
            }
            return;
        }

        let Some(user) = user else {
            return;
        };
        let watermark = self.watermarks.get(conversation_id);
        if let Some(unread) = state.unread.as_mut() {
            if is_unread(&message.sender_id, message.created_at, &user.id, watermark)
                && unread.ids.insert(message.id.clone())
            {
                tracing::debug!(
                    "Unread count for {} is now {}",
                    conversation_id,
                    unread.ids.len()
                );
            }
        }
    }
}

/// Drop a conversation that is neither viewed nor tracked, handing back its
/// subscription for teardown.
fn release_if_idle(
    conversations: &mut HashMap<String, ConversationState>,
    conversation_id: &str,
) -> Option<SubscriptionHandle> {
    let idle = conversations
        .get(conversation_id)
        .map_or(false, |state| !state.in_scope());
    if !idle {
        return None;
    }
    conversations
        .remove(conversation_id)
        .and_then(|state| state.subscription)
        .and_then(|sub| sub.handle)
}

fn validate_conversation_id(conversation_id: &str) -> SyncResult<()> {
    if conversation_id.trim().is_empty() {
        return Err(SyncError::InvalidArgument("conversation id is empty".to_string()));
    }
    Ok(())
}
