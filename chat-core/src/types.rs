use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix carried by identifiers of locally synthesized, unconfirmed messages.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// A chat message inside a conversation (a match between a recruiter and a candidate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(alias = "match_id")]
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Optimistic entries use a temporary id until the store confirms the row.
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Unread counts per conversation plus their sum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
}

impl UnreadCounts {
    pub fn from_counts(counts: BTreeMap<String, usize>) -> Self {
        let total = counts.values().sum();
        Self { counts, total }
    }

    pub fn get(&self, conversation_id: &str) -> usize {
        self.counts.get(conversation_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_ids() {
        let mut message = Message {
            id: "temp-1700000000000-0".to_string(),
            conversation_id: "m1".to_string(),
            sender_id: "u1".to_string(),
            content: "hi".to_string(),
            created_at: Utc::now(),
        };
        assert!(message.is_temporary());

        message.id = "msg-42".to_string();
        assert!(!message.is_temporary());
    }

    #[test]
    fn test_message_accepts_match_id_rows() {
        let row = serde_json::json!({
            "id": "msg-1",
            "match_id": "m1",
            "sender_id": "u2",
            "content": "hello",
            "created_at": "2025-01-01T10:00:00Z",
        });
        let message: Message = serde_json::from_value(row).unwrap();
        assert_eq!(message.conversation_id, "m1");
    }

    #[test]
    fn test_unread_total() {
        let mut counts = BTreeMap::new();
        counts.insert("m1".to_string(), 2);
        counts.insert("m2".to_string(), 3);
        let unread = UnreadCounts::from_counts(counts);
        assert_eq!(unread.total, 5);
        assert_eq!(unread.get("m2"), 3);
        assert_eq!(unread.get("missing"), 0);
    }
}
