/// Shared types for the chat sync layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of client-generated ids held by messages awaiting send confirmation
pub const PENDING_ID_PREFIX: &str = "temp-";

/// Generate a client-side id for an optimistic message
pub fn pending_id() -> String {
    format!("{}{}", PENDING_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Canonical unordered pair of participant ids: "dm:{min_id}:{max_id}"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationKey {
    low: String,
    high: String,
}

impl ConversationKey {
    pub fn between(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }

    pub fn includes(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The participant that is not `user_id`, if `user_id` takes part at all
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        if self.low == user_id {
            Some(&self.high)
        } else if self.high == user_id {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dm:{}:{}", self.low, self.high)
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let mut parts = raw.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("dm"), Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => {
                Ok(ConversationKey::between(a, b))
            }
            _ => Err(format!("invalid conversation key: {}", raw)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    #[serde(other)]
    File,
}

/// One user's reaction on one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: String,
    pub user_id: String,
    pub reaction: String,
    pub created_at: DateTime<Utc>,
}

/// A direct message between two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_key: ConversationKey,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_kind: Option<AttachmentKind>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Build a message, deriving the conversation key from the participants
    pub fn new(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let sender_id = sender_id.into();
        let receiver_id = receiver_id.into();
        Self {
            id: id.into(),
            conversation_key: ConversationKey::between(&sender_id, &receiver_id),
            sender_id,
            receiver_id,
            text: text.into(),
            attachment_ref: None,
            attachment_kind: None,
            created_at,
            updated_at: None,
            is_read: false,
            reactions: Vec::new(),
        }
    }

    /// Still waiting for the server to assign its final id
    pub fn is_pending(&self) -> bool {
        self.id.starts_with(PENDING_ID_PREFIX)
    }

    pub fn is_unread_for(&self, user_id: &str) -> bool {
        self.receiver_id == user_id && !self.is_read
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    /// Total order within a conversation: created_at, ties broken by id
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Directory entry for one counterpart (list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub other_user_id: String,
    /// Preview text of the last message
    pub last_message_text: String,
    /// None for a placeholder conversation with no messages yet
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn is_placeholder(&self) -> bool {
        self.last_message_timestamp.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub reference: String,
    pub kind: AttachmentKind,
}

/// Send request handed to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}
