/// Reconciliation engine
///
/// Owns the session's message store and merges three producers into it:
/// optimistic local writes, confirmations from the backend, and the push channel.
/// Every user mutation is two-phase: `begin_*` applies the optimistic change and
/// returns a pending handle, `finish_*` reconciles the backend result or rolls back.
/// The `async fn` wrappers run both phases around the backend call.
///
/// Results depend only on message ids, never on arrival order, so a push event may
/// land between the two phases of a mutation.
use crate::backend::{
    BackendResult, ChatBackend, LogNotifier, NoLookup, Notice, NoticeKind, Notifier, UserLookup,
};
use crate::chat_types::{
    pending_id, Attachment, ConversationKey, Message, OutgoingMessage, Reaction,
};
use crate::config::Config;
use crate::directory::ConversationDirectory;
use crate::error::{BackendError, Result, SyncError};
use crate::history_cache::HistoryCache;
use crate::message_store::{ConversationIter, MessageStore, Upserted};
use crate::normalizer::{self, RawChange, SyncEvent};
use crate::push::{ChannelState, PushChannel};
use crate::reactions::{self, ReactionSummary};
use crate::receipts::ReadReceipts;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tags a history fetch with the conversation and generation it was issued under,
/// and the store sequence its snapshot is measured against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub other_user_id: String,
    generation: u64,
    since: u64,
}

/// Optimistic send awaiting confirmation
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub temp_id: String,
    pub outgoing: OutgoingMessage,
}

#[derive(Debug, Clone)]
pub struct PendingEdit {
    pub message_id: String,
    pub new_text: String,
    previous: Message,
}

#[derive(Debug, Clone)]
pub struct PendingDelete {
    pub message_id: String,
    removed: Message,
}

/// Claimed read receipt awaiting the backend acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReceipt {
    pub other_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionChange {
    Set(String),
    Clear,
}

#[derive(Debug, Clone)]
pub struct PendingReaction {
    pub message_id: String,
    pub change: ReactionChange,
    conversation: ConversationKey,
    previous: Option<Reaction>,
}

pub struct ChatEngine<B: ChatBackend> {
    backend: B,
    notifier: Arc<dyn Notifier>,
    users: Arc<dyn UserLookup>,
    current_user: String,
    auto_mark_read: bool,
    store: MessageStore,
    directory: ConversationDirectory,
    receipts: ReadReceipts,
    channel: PushChannel,
    active: Option<String>,
    /// Bumped on every active-conversation change
    generation: u64,
    cache: Option<HistoryCache>,
    channel_error_reported: bool,
}

impl<B: ChatBackend> ChatEngine<B> {
    pub fn new(backend: B, config: &Config) -> Self {
        let cache = config
            .data_dir
            .as_ref()
            .and_then(|dir| match HistoryCache::open(dir, &config.user_id) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    warn!("History cache disabled: {}", e);
                    None
                }
            });

        info!("Chat session created for {}", config.user_id);
        Self {
            backend,
            notifier: Arc::new(LogNotifier),
            users: Arc::new(NoLookup),
            current_user: config.user_id.clone(),
            auto_mark_read: config.auto_mark_read,
            store: MessageStore::new(),
            directory: ConversationDirectory::with_placeholder(
                config.user_id.clone(),
                config.placeholder_text.clone(),
            ),
            receipts: ReadReceipts::new(),
            channel: PushChannel::new(),
            active: None,
            generation: 0,
            cache,
            channel_error_reported: false,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_user_lookup(mut self, users: Arc<dyn UserLookup>) -> Self {
        self.users = users;
        self
    }

    // ─── Read-only views ─────────────────────────────────────────────────────

    pub fn current_user(&self) -> &str {
        &self.current_user
    }

    pub fn messages(&self) -> &MessageStore {
        &self.store
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn receipts(&self) -> &ReadReceipts {
        &self.receipts
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn channel(&self) -> &PushChannel {
        &self.channel
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Ordered messages exchanged with `other`
    pub fn conversation(&self, other: &str) -> ConversationIter<'_> {
        self.store
            .list_by_conversation(&ConversationKey::between(&self.current_user, other))
    }

    pub fn reaction_summary(&self, message_id: &str) -> Vec<ReactionSummary> {
        self.store
            .get(message_id)
            .map(|m| reactions::summarize(&m.reactions, &self.current_user))
            .unwrap_or_default()
    }

    // ─── Session lifecycle ───────────────────────────────────────────────────

    /// Warm from the cache, load the directory and subscribe to the push channel.
    /// A failed directory load is reported but does not stop the session.
    pub async fn start(&mut self) -> Result<()> {
        self.warm_from_cache();
        if let Err(e) = self.load_conversations().await {
            warn!("Starting without server conversations: {}", e);
        }
        self.connect().await
    }

    /// Subscribe to the push channel (from Disconnected or Error)
    pub async fn connect(&mut self) -> Result<()> {
        self.channel.begin_connect()?;
        match self.backend.subscribe(&self.current_user).await {
            Ok(stream) => {
                self.channel_error_reported = false;
                self.channel.attach(stream)
            }
            Err(e) => {
                self.channel.fail(e.to_string());
                self.notifier.notify(Notice::new(
                    NoticeKind::ChannelError,
                    format!("Live updates unavailable: {}", e),
                ));
                Err(SyncError::Channel(e.to_string()))
            }
        }
    }

    /// Retry after a channel error. No backoff; callers decide when.
    pub async fn reconnect(&mut self) -> Result<()> {
        if self.channel.state() != ChannelState::Error {
            return Err(SyncError::Channel(format!(
                "reconnect requires Error state, channel is {:?}",
                self.channel.state()
            )));
        }
        self.connect().await
    }

    /// Tear the session down: persist the cache, drop the subscription, forget all state
    pub fn logout(&mut self) {
        if let Err(e) = self.persist() {
            warn!("Failed to persist history on logout: {}", e);
        }
        self.channel.disconnect();
        self.store.clear();
        self.directory.clear();
        self.receipts.clear();
        self.active = None;
        self.generation += 1;
        info!("Chat session for {} closed", self.current_user);
    }

    /// Write the confirmed message log to the offline cache
    pub fn persist(&self) -> Result<usize> {
        match &self.cache {
            Some(cache) => {
                let saved = cache.save_all(self.store.iter())?;
                debug!("Cached {} messages", saved);
                Ok(saved)
            }
            None => Ok(0),
        }
    }

    fn warm_from_cache(&mut self) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.load() {
            Ok(messages) => {
                let count = messages.len();
                for m in messages.into_iter().filter(|m| m.involves(&self.current_user)) {
                    self.store.upsert(m);
                }
                self.store.take_dirty();
                self.directory.rebuild(&self.store);
                info!("Loaded {} cached messages", count);
            }
            Err(e) => warn!("Ignoring unreadable history cache: {}", e),
        }
    }

    /// Seed the directory from the server's conversation list
    pub async fn load_conversations(&mut self) -> Result<usize> {
        match self.backend.fetch_conversations(&self.current_user).await {
            Ok(summaries) => {
                let count = summaries.len();
                self.directory.seed(&self.store, summaries);
                Ok(count)
            }
            Err(e) => {
                self.notifier.notify(Notice::new(
                    NoticeKind::LoadError,
                    format!("Could not load conversations: {}", e),
                ));
                Err(SyncError::Load(e.to_string()))
            }
        }
    }

    // ─── Conversation switching ──────────────────────────────────────────────

    /// Make `other` the active conversation and issue a ticket for its history
    pub fn begin_open(&mut self, other: &str) -> FetchTicket {
        self.active = Some(other.to_string());
        self.generation += 1;
        self.directory.ensure_placeholder(&self.store, other);
        debug!("Opening conversation with {} (generation {})", other, self.generation);
        FetchTicket {
            other_user_id: other.to_string(),
            generation: self.generation,
            since: self.store.sequence(),
        }
    }

    /// Ticket was issued under the current active conversation
    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.generation
            && self.active.as_deref() == Some(ticket.other_user_id.as_str())
    }

    /// Apply a history fetch. Ok(false) when the ticket went stale and the result was dropped.
    /// A failed fetch leaves local state untouched.
    pub fn finish_open(
        &mut self,
        ticket: FetchTicket,
        result: BackendResult<Vec<Message>>,
    ) -> Result<bool> {
        if !self.is_current(&ticket) {
            debug!(
                "Discarding stale history for {} (generation {}, now {})",
                ticket.other_user_id, ticket.generation, self.generation
            );
            return Ok(false);
        }

        match result {
            Ok(history) => {
                self.install_history(&ticket.other_user_id, history, ticket.since);
                Ok(true)
            }
            Err(e) => {
                self.notifier.notify(
                    Notice::new(
                        NoticeKind::LoadError,
                        format!("Could not load messages with {}: {}", self.name_of(&ticket.other_user_id), e),
                    )
                    .about(ticket.other_user_id.clone()),
                );
                Err(SyncError::Load(e.to_string()))
            }
        }
    }

    /// Switch to `other`, load its history and send a read receipt if needed
    pub async fn open_conversation(&mut self, other: &str) -> Result<bool> {
        let ticket = self.begin_open(other);
        let result = self.fetch_history(other).await;
        let applied = self.finish_open(ticket, result)?;
        if applied {
            self.receipt_if_needed(other).await;
        }
        Ok(applied)
    }

    pub fn close_conversation(&mut self) {
        self.active = None;
        self.generation += 1;
    }

    /// History with reactions attached
    pub async fn fetch_history(&self, other: &str) -> BackendResult<Vec<Message>> {
        let mut history = self.backend.fetch_messages(&self.current_user, other).await?;
        let ids: Vec<String> = history.iter().map(|m| m.id.clone()).collect();
        if !ids.is_empty() {
            let mut grouped = reactions::group_by_message(self.backend.fetch_reactions(&ids).await?);
            for m in &mut history {
                m.reactions = grouped.remove(&m.id).unwrap_or_default();
            }
        }
        Ok(history)
    }

    /// Reload a conversation from the backend to converge after a rollback
    pub async fn refetch_conversation(&mut self, other: &str) -> Result<bool> {
        let generation = self.generation;
        let since = self.store.sequence();
        let result = self.fetch_history(other).await;
        if generation != self.generation {
            debug!("Discarding refetch for {}, conversation switched", other);
            return Ok(false);
        }
        match result {
            Ok(history) => {
                self.install_history(other, history, since);
                Ok(true)
            }
            Err(e) => {
                warn!("Refetch of conversation with {} failed: {}", other, e);
                Err(SyncError::Load(e.to_string()))
            }
        }
    }

    fn install_history(&mut self, other: &str, history: Vec<Message>, since: u64) {
        let key = ConversationKey::between(&self.current_user, other);
        let history: Vec<Message> = history
            .into_iter()
            .filter(|m| m.conversation_key == key)
            .collect();
        debug!("Installing {} messages for {}", history.len(), key);
        self.store.replace_conversation(&key, history, since);
        self.refresh_directory();
    }

    // ─── Send ────────────────────────────────────────────────────────────────

    /// Append the optimistic message under a client id
    pub fn begin_send(
        &mut self,
        receiver: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) -> PendingSend {
        let temp_id = pending_id();
        let mut optimistic = Message::new(
            temp_id.clone(),
            self.current_user.clone(),
            receiver,
            text,
            Utc::now(),
        );
        if let Some(att) = &attachment {
            optimistic.attachment_ref = Some(att.reference.clone());
            optimistic.attachment_kind = Some(att.kind);
        }

        self.store.upsert(optimistic);
        self.refresh_directory();
        PendingSend {
            temp_id,
            outgoing: OutgoingMessage {
                sender_id: self.current_user.clone(),
                receiver_id: receiver.to_string(),
                text: text.to_string(),
                attachment,
            },
        }
    }

    /// Swap the optimistic entry for the stored row, or roll it back
    pub async fn finish_send(
        &mut self,
        pending: PendingSend,
        result: BackendResult<Message>,
    ) -> Result<Message> {
        self.store.remove(&pending.temp_id);
        match result {
            Ok(stored) => {
                let id = stored.id.clone();
                if self.store.upsert(stored.clone()) == Upserted::Unchanged {
                    debug!("Send of {} already reconciled by push", id);
                }
                self.refresh_directory();
                Ok(self.store.get(&id).cloned().unwrap_or(stored))
            }
            Err(e) => {
                self.refresh_directory();
                Err(self.roll_back("send", &pending.outgoing.receiver_id, e).await)
            }
        }
    }

    pub async fn send_message(&mut self, receiver: &str, text: &str) -> Result<Message> {
        let pending = self.begin_send(receiver, text, None);
        let result = self.backend.send_message(&pending.outgoing).await;
        self.finish_send(pending, result).await
    }

    pub async fn send_attachment(
        &mut self,
        receiver: &str,
        text: &str,
        attachment: Attachment,
    ) -> Result<Message> {
        let pending = self.begin_send(receiver, text, Some(attachment));
        let result = self.backend.send_message(&pending.outgoing).await;
        self.finish_send(pending, result).await
    }

    // ─── Edit / delete ───────────────────────────────────────────────────────

    /// Look up a message the current user may change
    fn own_message(&self, message_id: &str, action: &str) -> Result<Message> {
        let message = self
            .store
            .get(message_id)
            .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
        if message.sender_id != self.current_user {
            let err = SyncError::PermissionDenied(format!(
                "only the sender can {} message {}",
                action, message_id
            ));
            let other = message.conversation_key.counterpart(&self.current_user).unwrap_or_default();
            self.report(action, other, &err);
            return Err(err);
        }
        if message.is_pending() {
            return Err(SyncError::Rejected(format!(
                "message {} has not been sent yet",
                message_id
            )));
        }
        Ok(message.clone())
    }

    pub fn begin_edit(&mut self, message_id: &str, new_text: &str) -> Result<PendingEdit> {
        let previous = self.own_message(message_id, "edit")?;
        let mut edited = previous.clone();
        edited.text = new_text.to_string();
        edited.updated_at = Some(Utc::now());

        self.store.upsert(edited);
        self.refresh_directory();
        Ok(PendingEdit {
            message_id: message_id.to_string(),
            new_text: new_text.to_string(),
            previous,
        })
    }

    pub async fn finish_edit(
        &mut self,
        pending: PendingEdit,
        result: BackendResult<Message>,
    ) -> Result<Message> {
        match result {
            Ok(stored) => {
                // A delete pushed in the meantime wins; do not resurrect
                if self.store.contains(&stored.id) {
                    self.store.upsert(stored.clone());
                    self.refresh_directory();
                }
                Ok(stored)
            }
            Err(e) => {
                if let Some(current) = self.store.get(&pending.message_id) {
                    let mut restored = current.clone();
                    restored.text = pending.previous.text.clone();
                    restored.updated_at = pending.previous.updated_at;
                    self.store.upsert(restored);
                    self.refresh_directory();
                }
                Err(self.roll_back("edit", &pending.previous.receiver_id, e).await)
            }
        }
    }

    pub async fn edit_message(&mut self, message_id: &str, new_text: &str) -> Result<Message> {
        let pending = self.begin_edit(message_id, new_text)?;
        let result = self
            .backend
            .edit_message(message_id, new_text, &self.current_user)
            .await;
        self.finish_edit(pending, result).await
    }

    pub fn begin_delete(&mut self, message_id: &str) -> Result<PendingDelete> {
        self.own_message(message_id, "delete")?;
        let removed = self
            .store
            .remove(message_id)
            .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
        self.refresh_directory();
        Ok(PendingDelete {
            message_id: message_id.to_string(),
            removed,
        })
    }

    pub async fn finish_delete(
        &mut self,
        pending: PendingDelete,
        result: BackendResult<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let other = pending.removed.receiver_id.clone();
                self.store.upsert(pending.removed);
                self.refresh_directory();
                Err(self.roll_back("delete", &other, e).await)
            }
        }
    }

    pub async fn delete_message(&mut self, message_id: &str) -> Result<()> {
        let pending = self.begin_delete(message_id)?;
        let result = self
            .backend
            .delete_message(message_id, &self.current_user)
            .await;
        self.finish_delete(pending, result).await
    }

    // ─── Reactions ───────────────────────────────────────────────────────────

    pub fn begin_reaction(
        &mut self,
        message_id: &str,
        change: ReactionChange,
    ) -> Result<PendingReaction> {
        let message = self
            .store
            .get(message_id)
            .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
        if message.is_pending() {
            return Err(SyncError::Rejected(format!(
                "message {} has not been sent yet",
                message_id
            )));
        }
        let conversation = message.conversation_key.clone();
        let me = self.current_user.clone();

        let previous = match &change {
            ReactionChange::Set(value) => {
                let row = Reaction {
                    message_id: message_id.to_string(),
                    user_id: me,
                    reaction: value.clone(),
                    created_at: Utc::now(),
                };
                self.store
                    .update_reactions(message_id, |set| reactions::upsert(set, row))
                    .flatten()
            }
            ReactionChange::Clear => self
                .store
                .update_reactions(message_id, |set| reactions::remove(set, &me))
                .flatten(),
        };
        self.refresh_directory();

        Ok(PendingReaction {
            message_id: message_id.to_string(),
            change,
            conversation,
            previous,
        })
    }

    pub async fn finish_reaction(
        &mut self,
        pending: PendingReaction,
        result: BackendResult<Option<Reaction>>,
    ) -> Result<Option<Reaction>> {
        match result {
            Ok(confirmed) => {
                if let Some(row) = &confirmed {
                    let row = row.clone();
                    self.store
                        .update_reactions(&pending.message_id, |set| reactions::upsert(set, row));
                    self.refresh_directory();
                }
                Ok(confirmed)
            }
            Err(e) => {
                let err = SyncError::from(e);
                let other = pending
                    .conversation
                    .counterpart(&self.current_user)
                    .unwrap_or_default()
                    .to_string();
                self.report("react to", &other, &err);
                if let Err(refetch_err) = self.refetch_reactions(&pending.conversation).await {
                    warn!("Reaction refetch failed, restoring locally: {}", refetch_err);
                    let me = self.current_user.clone();
                    let previous = pending.previous.clone();
                    self.store.update_reactions(&pending.message_id, |set| {
                        reactions::remove(set, &me);
                        if let Some(prev) = previous {
                            reactions::upsert(set, prev);
                        }
                    });
                    self.refresh_directory();
                }
                Err(err)
            }
        }
    }

    /// Set the current user's reaction. Repeating the same value removes it.
    pub async fn apply_reaction(&mut self, message_id: &str, reaction: &str) -> Result<Option<Reaction>> {
        let already = self
            .store
            .get(message_id)
            .and_then(|m| reactions::user_reaction(&m.reactions, &self.current_user))
            .map(|r| r.reaction == reaction)
            .unwrap_or(false);
        let change = if already {
            ReactionChange::Clear
        } else {
            ReactionChange::Set(reaction.to_string())
        };
        self.run_reaction(message_id, change).await
    }

    pub async fn remove_reaction(&mut self, message_id: &str) -> Result<Option<Reaction>> {
        self.run_reaction(message_id, ReactionChange::Clear).await
    }

    async fn run_reaction(&mut self, message_id: &str, change: ReactionChange) -> Result<Option<Reaction>> {
        let pending = self.begin_reaction(message_id, change)?;
        let result = match &pending.change {
            ReactionChange::Set(value) => self
                .backend
                .upsert_reaction(message_id, &self.current_user, value)
                .await
                .map(Some),
            ReactionChange::Clear => self
                .backend
                .remove_reaction(message_id, &self.current_user)
                .await
                .map(|_| None),
        };
        self.finish_reaction(pending, result).await
    }

    /// Replace every reaction set of a conversation with the server's
    async fn refetch_reactions(&mut self, key: &ConversationKey) -> Result<()> {
        let ids: Vec<String> = self
            .store
            .list_by_conversation(key)
            .filter(|m| !m.is_pending())
            .map(|m| m.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let mut grouped = reactions::group_by_message(self.backend.fetch_reactions(&ids).await?);
        for id in &ids {
            let fresh = grouped.remove(id).unwrap_or_default();
            self.store.update_reactions(id, |set| *set = fresh);
        }
        self.refresh_directory();
        Ok(())
    }

    // ─── Read receipts ───────────────────────────────────────────────────────

    /// Claim the read receipt for `other`. None while one is already in flight.
    pub fn begin_mark_read(&mut self, other: &str) -> Option<PendingReceipt> {
        self.receipts.begin(other).then(|| PendingReceipt {
            other_user_id: other.to_string(),
        })
    }

    /// Flip local read flags once the backend acknowledged the receipt
    pub fn finish_mark_read(
        &mut self,
        pending: PendingReceipt,
        result: BackendResult<()>,
    ) -> Result<usize> {
        let other = pending.other_user_id.as_str();
        match result {
            Ok(()) => {
                let marked = self.store.mark_read(other, &self.current_user);
                self.directory.clear_seeded_unread(&self.store, other);
                self.refresh_directory();
                self.receipts.finish(other, Some(marked));
                debug!("Marked {} messages from {} read", marked, other);
                Ok(marked)
            }
            Err(e) => {
                self.receipts.finish(other, None);
                warn!("Read receipt for {} failed: {}", other, e);
                Err(e.into())
            }
        }
    }

    /// Mark everything `other` sent us as read. Returns how many local messages flipped.
    pub async fn mark_read(&mut self, other: &str) -> Result<usize> {
        let Some(pending) = self.begin_mark_read(other) else {
            return Ok(0);
        };
        let result = self.backend.mark_read(&self.current_user, other).await;
        self.finish_mark_read(pending, result)
    }

    async fn receipt_if_needed(&mut self, other: &str) {
        if !self.auto_mark_read || !self.receipts.needs_receipt(&self.directory, other) {
            return;
        }
        if let Err(e) = self.mark_read(other).await {
            debug!("Automatic read receipt skipped: {}", e);
        }
    }

    // ─── Push channel ────────────────────────────────────────────────────────

    /// Merge one normalized event. Returns whether the store changed.
    pub fn apply_event(&mut self, event: SyncEvent) -> bool {
        let kind = event.kind();
        let changed = match event {
            SyncEvent::MessageAdded(message) | SyncEvent::MessageChanged(message) => {
                if !message.involves(&self.current_user) {
                    debug!("Ignoring {} for foreign conversation {}", kind, message.conversation_key);
                    return false;
                }
                let incoming_from = (message.sender_id != self.current_user).then(|| message.sender_id.clone());
                let outcome = self.store.upsert(message);
                if outcome == Upserted::Inserted {
                    if let Some(sender) = incoming_from {
                        self.announce(&sender);
                    }
                }
                outcome != Upserted::Unchanged
            }
            SyncEvent::MessageRemoved(id) => self.store.remove(&id).is_some(),
            SyncEvent::ReactionUpserted(row) => {
                let message_id = row.message_id.clone();
                self.store
                    .update_reactions(&message_id, |set| reactions::upsert_newer(set, row))
                    .unwrap_or(false)
            }
            SyncEvent::ReactionRemoved { message_id, user_id } => self
                .store
                .update_reactions(&message_id, |set| reactions::remove(set, &user_id).is_some())
                .unwrap_or(false),
        };

        if changed {
            self.refresh_directory();
        } else {
            debug!("Push {} was a no-op", kind);
        }
        changed
    }

    /// Normalize and apply one raw change, then acknowledge reads in the active conversation
    pub async fn handle_change(&mut self, change: RawChange) -> bool {
        let Some(event) = normalizer::normalize(&change) else {
            return false;
        };
        let changed = self.apply_event(event);
        if changed {
            if let Some(active) = self.active.clone() {
                self.receipt_if_needed(&active).await;
            }
        }
        changed
    }

    /// Apply every buffered push event. Returns how many changed the store.
    pub async fn drain_push(&mut self) -> usize {
        let mut applied = 0;
        while let Some(change) = self.channel.try_next() {
            if self.handle_change(change).await {
                applied += 1;
            }
        }
        self.check_channel();
        applied
    }

    /// Wait for the next push event. None once the channel is not subscribed.
    pub async fn next_push(&mut self) -> Option<bool> {
        match self.channel.next().await {
            Some(change) => Some(self.handle_change(change).await),
            None => {
                self.check_channel();
                None
            }
        }
    }

    fn check_channel(&mut self) {
        if self.channel.state() == ChannelState::Error && !self.channel_error_reported {
            self.channel_error_reported = true;
            let reason = self.channel.last_error().unwrap_or("unknown").to_string();
            self.notifier.notify(Notice::new(
                NoticeKind::ChannelError,
                format!("Live updates interrupted: {}", reason),
            ));
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn refresh_directory(&mut self) {
        let dirty = self.store.take_dirty();
        if !dirty.is_empty() {
            self.directory.refresh(&self.store, dirty.iter());
        }
    }

    fn name_of(&self, user_id: &str) -> String {
        self.users
            .display_name(user_id)
            .unwrap_or_else(|| user_id.to_string())
    }

    fn announce(&self, sender: &str) {
        if self.active.as_deref() == Some(sender) {
            return;
        }
        self.notifier.notify(
            Notice::new(NoticeKind::NewMessage, format!("New message from {}", self.name_of(sender)))
                .about(sender),
        );
    }

    fn report(&self, action: &str, other: &str, err: &SyncError) {
        let kind = if err.is_permission() {
            NoticeKind::PermissionDenied
        } else {
            NoticeKind::Failure
        };
        self.notifier.notify(
            Notice::new(
                kind,
                format!("Could not {} message with {}: {}", action, self.name_of(other), err),
            )
            .about(other),
        );
    }

    /// Surface a failed mutation and refetch the conversation to converge
    async fn roll_back(&mut self, action: &str, other: &str, err: BackendError) -> SyncError {
        let err = SyncError::from(err);
        warn!("{} failed, rolled back: {}", action, err);
        self.report(action, other, &err);
        if let Err(refetch_err) = self.refetch_conversation(other).await {
            debug!("Convergence refetch failed: {}", refetch_err);
        }
        err
    }
}
