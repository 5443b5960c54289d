use chat_core::Message;
use tokio::sync::watch;

/// Live, ordered view of one open conversation.
///
/// Every change to the conversation's cache publishes a fresh snapshot. The
/// view ends (`changed` returns `None`) once the conversation is closed.
#[derive(Debug, Clone)]
pub struct ConversationView {
    conversation_id: String,
    updates: watch::Receiver<Vec<Message>>,
}

impl ConversationView {
    pub(crate) fn new(conversation_id: impl Into<String>, updates: watch::Receiver<Vec<Message>>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            updates,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.updates.borrow().clone()
    }

    /// Wait for the next snapshot.
    pub async fn changed(&mut self) -> Option<Vec<Message>> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }
}
