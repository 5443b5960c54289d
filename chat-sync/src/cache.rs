use chat_core::Message;

/// Ordered message list of one conversation.
///
/// Entries stay sorted by `created_at` ascending and no two canonical entries
/// share an id. Temporary entries are only added and removed explicitly.
#[derive(Debug, Default, Clone)]
pub struct MessageCache {
    messages: Vec<Message>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a persisted row. Returns `false` when the id is already cached.
    pub fn merge(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Merge many rows, returning how many were new.
    pub fn merge_all(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut added = 0;
        for message in messages {
            if self.merge(message) {
                added += 1;
            }
        }
        added
    }

    /// Add an optimistic entry at its sorted position.
    pub fn insert_pending(&mut self, message: Message) {
        debug_assert!(message.is_temporary());
        self.insert_sorted(message);
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(index))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    // Notifications are not delivered in creation order, so never append blindly.
    // Equal timestamps keep arrival order.
    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(index, message);
    }
}
