/// Push-channel payload normalization
/// Raw row-change notifications become typed sync events; anything unusable is dropped
use crate::chat_types::{AttachmentKind, ConversationKey, Message, Reaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MESSAGES_TABLE: &str = "messages";
pub const REACTIONS_TABLE: &str = "message_reactions";

/// Row change as delivered by the push service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(default = "default_table")]
    pub table: String,
    /// "insert" | "update" | "delete", any case
    #[serde(alias = "eventType", alias = "type")]
    pub op: String,
    /// Row snapshot after the change (insert/update)
    #[serde(default, alias = "new")]
    pub row: Option<serde_json::Value>,
    /// Row identifier or snapshot before the change (delete)
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

fn default_table() -> String {
    MESSAGES_TABLE.to_string()
}

impl RawChange {
    pub fn insert(table: &str, row: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            op: "insert".to_string(),
            row: Some(row),
            old: None,
        }
    }

    pub fn update(table: &str, row: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            op: "update".to_string(),
            row: Some(row),
            old: None,
        }
    }

    pub fn delete(table: &str, old: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            op: "delete".to_string(),
            row: None,
            old: Some(old),
        }
    }
}

/// Typed event applied by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    MessageAdded(Message),
    MessageChanged(Message),
    MessageRemoved(String),
    ReactionUpserted(Reaction),
    ReactionRemoved { message_id: String, user_id: String },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::MessageAdded(_) => "message_added",
            SyncEvent::MessageChanged(_) => "message_changed",
            SyncEvent::MessageRemoved(_) => "message_removed",
            SyncEvent::ReactionUpserted(_) => "reaction_upserted",
            SyncEvent::ReactionRemoved { .. } => "reaction_removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Insert,
    Update,
    Delete,
}

fn parse_op(raw: &str) -> Option<Op> {
    match raw.to_ascii_lowercase().as_str() {
        "insert" => Some(Op::Insert),
        "update" => Some(Op::Update),
        "delete" => Some(Op::Delete),
        _ => None,
    }
}

/// Message row as stored by the backend; the conversation key is derived locally
#[derive(Debug, Deserialize)]
struct MessageRow {
    id: serde_json::Value,
    sender_id: String,
    receiver_id: String,
    #[serde(default, alias = "message")]
    text: Option<String>,
    #[serde(default, alias = "file_url", alias = "image_url")]
    attachment_ref: Option<String>,
    #[serde(default, alias = "file_type")]
    attachment_kind: Option<AttachmentKind>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_read: bool,
}

impl MessageRow {
    fn into_message(self) -> Option<Message> {
        let id = id_string(&self.id)?;
        Some(Message {
            id,
            conversation_key: ConversationKey::between(&self.sender_id, &self.receiver_id),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            text: self.text.unwrap_or_default(),
            attachment_ref: self.attachment_ref,
            attachment_kind: self.attachment_kind,
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_read: self.is_read,
            reactions: Vec::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReactionRow {
    message_id: serde_json::Value,
    user_id: String,
    #[serde(default)]
    reaction: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

/// Row ids arrive as strings or integers depending on the table
fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Convert one raw change. None means the payload was dropped (already logged).
pub fn normalize(change: &RawChange) -> Option<SyncEvent> {
    let Some(op) = parse_op(&change.op) else {
        warn!("Dropping push event with unknown operation '{}'", change.op);
        return None;
    };

    match change.table.as_str() {
        MESSAGES_TABLE => normalize_message(op, change),
        REACTIONS_TABLE => normalize_reaction(op, change),
        other => {
            warn!("Dropping push event for unknown table '{}'", other);
            None
        }
    }
}

/// Normalize a batch, skipping dropped payloads
pub fn normalize_all<'a>(changes: impl IntoIterator<Item = &'a RawChange>) -> Vec<SyncEvent> {
    changes.into_iter().filter_map(normalize).collect()
}

fn normalize_message(op: Op, change: &RawChange) -> Option<SyncEvent> {
    match op {
        Op::Insert | Op::Update => {
            let Some(row) = change.row.clone() else {
                warn!("Dropping {:?} message event without a row snapshot", op);
                return None;
            };
            let message = match serde_json::from_value::<MessageRow>(row) {
                Ok(row) => row.into_message(),
                Err(e) => {
                    warn!("Dropping malformed message row: {}", e);
                    return None;
                }
            };
            let Some(message) = message else {
                warn!("Dropping message row without a usable id");
                return None;
            };
            Some(match op {
                Op::Insert => SyncEvent::MessageAdded(message),
                _ => SyncEvent::MessageChanged(message),
            })
        }
        Op::Delete => {
            let id = change
                .old
                .as_ref()
                .or(change.row.as_ref())
                .and_then(|v| match v {
                    serde_json::Value::Object(map) => map.get("id").and_then(id_string),
                    other => id_string(other),
                });
            match id {
                Some(id) => Some(SyncEvent::MessageRemoved(id)),
                None => {
                    warn!("Dropping message delete event without an id");
                    None
                }
            }
        }
    }
}

fn normalize_reaction(op: Op, change: &RawChange) -> Option<SyncEvent> {
    let snapshot = match op {
        Op::Delete => change.old.as_ref().or(change.row.as_ref()),
        _ => change.row.as_ref(),
    };
    let Some(snapshot) = snapshot.cloned() else {
        warn!("Dropping {:?} reaction event without a row", op);
        return None;
    };
    let row = match serde_json::from_value::<ReactionRow>(snapshot) {
        Ok(row) => row,
        Err(e) => {
            warn!("Dropping malformed reaction row: {}", e);
            return None;
        }
    };
    let Some(message_id) = id_string(&row.message_id) else {
        warn!("Dropping reaction row without a message id");
        return None;
    };

    match op {
        Op::Delete => Some(SyncEvent::ReactionRemoved {
            message_id,
            user_id: row.user_id,
        }),
        _ => {
            let Some(reaction) = row.reaction.filter(|r| !r.is_empty()) else {
                warn!("Dropping reaction row without a reaction value");
                return None;
            };
            Some(SyncEvent::ReactionUpserted(Reaction {
                message_id,
                user_id: row.user_id,
                reaction,
                created_at: row.created_at.unwrap_or_else(Utc::now),
            }))
        }
    }
}
