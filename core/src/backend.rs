/// Collaborator ports: backend calls, toast reporting, user lookup
///
/// The engine talks to the outside world only through these traits.
use crate::chat_types::{ConversationSummary, Message, OutgoingMessage, Reaction};
use crate::error::BackendError;
use crate::push::ChangeStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// REST + realtime collaborator
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_conversations(&self, current_user: &str) -> BackendResult<Vec<ConversationSummary>>;

    /// Ordered history. The backend also marks the counterpart's messages read.
    async fn fetch_messages(&self, current_user: &str, other_user: &str) -> BackendResult<Vec<Message>>;

    async fn fetch_reactions(&self, message_ids: &[String]) -> BackendResult<Vec<Reaction>>;

    /// Returns the stored row with its final id and timestamp
    async fn send_message(&self, outgoing: &OutgoingMessage) -> BackendResult<Message>;

    /// Fails with `Forbidden` unless `requesting_user` sent the message
    async fn edit_message(
        &self,
        message_id: &str,
        new_text: &str,
        requesting_user: &str,
    ) -> BackendResult<Message>;

    /// Fails with `Forbidden` unless `requesting_user` sent the message
    async fn delete_message(&self, message_id: &str, requesting_user: &str) -> BackendResult<()>;

    async fn mark_read(&self, current_user: &str, counterpart: &str) -> BackendResult<()>;

    async fn upsert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        reaction: &str,
    ) -> BackendResult<Reaction>;

    async fn remove_reaction(&self, message_id: &str, user_id: &str) -> BackendResult<()>;

    /// Row changes where `current_user` is sender or receiver
    async fn subscribe(&self, current_user: &str) -> BackendResult<ChangeStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A mutation failed and was rolled back
    Failure,
    /// Edit/delete attempted on someone else's message
    PermissionDenied,
    /// A conversation could not be loaded
    LoadError,
    /// Counterpart message arrived outside the active conversation
    NewMessage,
    ChannelError,
}

/// User-facing notification (toast)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
    /// Counterpart the notice is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_user_id: Option<String>,
}

impl Notice {
    pub fn new(kind: NoticeKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            other_user_id: None,
        }
    }

    pub fn about(mut self, other_user_id: impl Into<String>) -> Self {
        self.other_user_id = Some(other_user_id.into());
        self
    }
}

/// Toast reporter port
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Display-name lookup port
pub trait UserLookup: Send + Sync {
    fn display_name(&self, user_id: &str) -> Option<String>;
}

impl UserLookup for HashMap<String, String> {
    fn display_name(&self, user_id: &str) -> Option<String> {
        self.get(user_id).cloned()
    }
}

/// Lookup that knows nobody; callers fall back to raw ids
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLookup;

impl UserLookup for NoLookup {
    fn display_name(&self, _user_id: &str) -> Option<String> {
        None
    }
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::NewMessage => info!("{}", notice.text),
            NoticeKind::ChannelError => error!("{}", notice.text),
            _ => warn!("{}", notice.text),
        }
    }
}

/// Fans notices out to UI subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notice>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notice: Notice) {
        // No subscribers is fine
        let _ = self.tx.send(notice);
    }
}
