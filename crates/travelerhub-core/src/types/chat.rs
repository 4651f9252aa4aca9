//! Direct messaging records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConversationId, MessageId, UserId};

/// A two-party conversation.
///
/// Created implicitly by the backend when two identities first exchange a
/// message; the client never inserts conversations itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_a: UserId,
    pub user_b: UserId,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Whether `user` is one of the two participants
    pub fn includes(&self, user: &UserId) -> bool {
        &self.user_a == user || &self.user_b == user
    }

    /// The participant that is not `me`, if `me` participates at all
    pub fn other_participant(&self, me: &UserId) -> Option<&UserId> {
        if &self.user_a == me {
            Some(&self.user_b)
        } else if &self.user_b == me {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

/// A direct message inside one conversation.
///
/// Immutable once created apart from the read/edit/delete markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Row shape sent when inserting a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_other_participant() {
        let convo = Conversation {
            id: ConversationId::from("c1"),
            user_a: UserId::from("u1"),
            user_b: UserId::from("u2"),
            last_message_id: None,
            last_message_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(
            convo.other_participant(&UserId::from("u1")),
            Some(&UserId::from("u2"))
        );
        assert_eq!(
            convo.other_participant(&UserId::from("u2")),
            Some(&UserId::from("u1"))
        );
        assert_eq!(convo.other_participant(&UserId::from("u3")), None);
        assert!(!convo.includes(&UserId::from("u3")));
    }

    #[test]
    fn test_message_decodes_with_missing_markers() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "conversation_id": "c1",
            "sender_id": "u1",
            "receiver_id": "u2",
            "content": "hi",
            "created_at": "2026-10-18T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(msg.content, "hi");
        assert!(msg.read_at.is_none());
        assert!(!msg.is_deleted());
    }
}
