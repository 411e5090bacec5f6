/// In-process chat backend
/// Keeps rows in memory and fans row changes out to subscribers like the realtime service does.
/// Used by the demo binary and the tests; failures can be injected per call.
use crate::backend::{BackendResult, ChatBackend};
use crate::chat_types::{ConversationKey, ConversationSummary, Message, OutgoingMessage, Reaction};
use crate::error::BackendError;
use crate::normalizer::{RawChange, MESSAGES_TABLE, REACTIONS_TABLE};
use crate::push::ChangeStream;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::RwLock;
use tracing::debug;

/// Backend operation, for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    FetchConversations,
    FetchMessages,
    FetchReactions,
    Send,
    Edit,
    Delete,
    MarkRead,
    UpsertReaction,
    RemoveReaction,
    Subscribe,
}

struct Subscriber {
    user_id: String,
    tx: UnboundedSender<RawChange>,
}

struct State {
    messages: BTreeMap<String, Message>,
    reactions: HashMap<(String, String), Reaction>,
    subscribers: Vec<Subscriber>,
    failures: HashMap<Call, Vec<BackendError>>,
    next_id: u64,
    clock: DateTime<Utc>,
    calls: Vec<Call>,
}

impl State {
    fn take_failure(&mut self, call: Call) -> BackendResult<()> {
        self.calls.push(call);
        match self.failures.get_mut(&call) {
            Some(queue) if !queue.is_empty() => Err(queue.remove(0)),
            _ => Ok(()),
        }
    }

    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += Duration::seconds(1);
        self.clock
    }

    /// Push a change to every subscriber taking part in the conversation
    fn publish(&mut self, key: &ConversationKey, change: RawChange) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for sub in &self.subscribers {
            if key.includes(&sub.user_id) {
                let _ = sub.tx.send(change.clone());
            }
        }
    }

    fn with_reactions(&self, message: &Message) -> Message {
        let mut out = message.clone();
        out.reactions = self
            .reactions
            .values()
            .filter(|r| r.message_id == message.id)
            .cloned()
            .collect();
        out.reactions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }
}

fn message_row(m: &Message) -> serde_json::Value {
    json!({
        "id": m.id,
        "sender_id": m.sender_id,
        "receiver_id": m.receiver_id,
        "message": m.text,
        "attachment_ref": m.attachment_ref,
        "attachment_kind": m.attachment_kind,
        "created_at": m.created_at,
        "updated_at": m.updated_at,
        "is_read": m.is_read,
    })
}

fn reaction_row(r: &Reaction) -> serde_json::Value {
    json!({
        "message_id": r.message_id,
        "user_id": r.user_id,
        "reaction": r.reaction,
        "created_at": r.created_at,
    })
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Utc::now())
    }

    /// Server timestamps start at `start` and advance one second per write
    pub fn with_clock(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                messages: BTreeMap::new(),
                reactions: HashMap::new(),
                subscribers: Vec::new(),
                failures: HashMap::new(),
                next_id: 100,
                clock: start,
                calls: Vec::new(),
            })),
        }
    }

    /// Make the next `call` fail with `err`. Queued failures are consumed in order.
    pub async fn fail_next(&self, call: Call, err: BackendError) {
        let mut state = self.state.write().await;
        state.failures.entry(call).or_default().push(err);
    }

    /// Calls received so far, in order
    pub async fn calls(&self) -> Vec<Call> {
        self.state.read().await.calls.clone()
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        let state = self.state.read().await;
        state.messages.get(id).map(|m| state.with_reactions(m))
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    /// Store a message from `from` as if another client had sent it
    pub async fn deliver(&self, from: &str, to: &str, text: &str) -> Message {
        let outgoing = OutgoingMessage {
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            text: text.to_string(),
            attachment: None,
        };
        let mut state = self.state.write().await;
        Self::store_message(&mut state, &outgoing)
    }

    /// Hand a raw payload to every subscription of `user_id`
    pub async fn push_raw(&self, user_id: &str, change: RawChange) {
        let state = self.state.read().await;
        for sub in state.subscribers.iter().filter(|s| s.user_id == user_id) {
            let _ = sub.tx.send(change.clone());
        }
    }

    /// Drop every live subscription; receivers observe a closed stream
    pub async fn close_subscriptions(&self) {
        self.state.write().await.subscribers.clear();
    }

    fn store_message(state: &mut State, outgoing: &OutgoingMessage) -> Message {
        let id = format!("m{}", state.next_id);
        state.next_id += 1;
        let created_at = state.tick();

        let mut message = Message::new(
            id,
            outgoing.sender_id.clone(),
            outgoing.receiver_id.clone(),
            outgoing.text.clone(),
            created_at,
        );
        if let Some(att) = &outgoing.attachment {
            message.attachment_ref = Some(att.reference.clone());
            message.attachment_kind = Some(att.kind);
        }

        state.messages.insert(message.id.clone(), message.clone());
        let key = message.conversation_key.clone();
        state.publish(&key, RawChange::insert(MESSAGES_TABLE, message_row(&message)));
        debug!("Stored message {} in {}", message.id, key);
        message
    }

    fn mark_read_locked(state: &mut State, reader: &str, sender: &str) {
        let ids: Vec<String> = state
            .messages
            .values()
            .filter(|m| m.sender_id == sender && m.is_unread_for(reader))
            .map(|m| m.id.clone())
            .collect();
        for id in ids {
            let Some(m) = state.messages.get_mut(&id) else {
                continue;
            };
            m.is_read = true;
            let row = message_row(m);
            let key = m.conversation_key.clone();
            state.publish(&key, RawChange::update(MESSAGES_TABLE, row));
        }
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn fetch_conversations(&self, current_user: &str) -> BackendResult<Vec<ConversationSummary>> {
        let mut state = self.state.write().await;
        state.take_failure(Call::FetchConversations)?;

        let mut latest: HashMap<String, (&Message, u32)> = HashMap::new();
        for m in state.messages.values().filter(|m| m.involves(current_user)) {
            let Some(other) = m.conversation_key.counterpart(current_user) else {
                continue;
            };
            let entry = latest.entry(other.to_string()).or_insert((m, 0));
            if m.order_key() > entry.0.order_key() {
                entry.0 = m;
            }
            if m.is_unread_for(current_user) {
                entry.1 += 1;
            }
        }

        Ok(latest
            .into_iter()
            .map(|(other, (m, unread))| ConversationSummary {
                other_user_id: other,
                last_message_text: m.text.clone(),
                last_message_timestamp: Some(m.created_at),
                unread_count: unread,
            })
            .collect())
    }

    async fn fetch_messages(&self, current_user: &str, other_user: &str) -> BackendResult<Vec<Message>> {
        let mut state = self.state.write().await;
        state.take_failure(Call::FetchMessages)?;

        Self::mark_read_locked(&mut state, current_user, other_user);
        let key = ConversationKey::between(current_user, other_user);
        let mut out: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.conversation_key == key)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(out)
    }

    async fn fetch_reactions(&self, message_ids: &[String]) -> BackendResult<Vec<Reaction>> {
        let mut state = self.state.write().await;
        state.take_failure(Call::FetchReactions)?;
        Ok(state
            .reactions
            .values()
            .filter(|r| message_ids.contains(&r.message_id))
            .cloned()
            .collect())
    }

    async fn send_message(&self, outgoing: &OutgoingMessage) -> BackendResult<Message> {
        let mut state = self.state.write().await;
        state.take_failure(Call::Send)?;
        if outgoing.text.trim().is_empty() && outgoing.attachment.is_none() {
            return Err(BackendError::Rejected("empty message".to_string()));
        }
        Ok(Self::store_message(&mut state, outgoing))
    }

    async fn edit_message(
        &self,
        message_id: &str,
        new_text: &str,
        requesting_user: &str,
    ) -> BackendResult<Message> {
        let mut state = self.state.write().await;
        state.take_failure(Call::Edit)?;
        let now = state.tick();

        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| BackendError::NotFound(message_id.to_string()))?;
        if message.sender_id != requesting_user {
            return Err(BackendError::Forbidden(format!(
                "{} did not send {}",
                requesting_user, message_id
            )));
        }
        message.text = new_text.to_string();
        message.updated_at = Some(now);

        let updated = message.clone();
        state.publish(
            &updated.conversation_key,
            RawChange::update(MESSAGES_TABLE, message_row(&updated)),
        );
        Ok(state.with_reactions(&updated))
    }

    async fn delete_message(&self, message_id: &str, requesting_user: &str) -> BackendResult<()> {
        let mut state = self.state.write().await;
        state.take_failure(Call::Delete)?;

        let message = state
            .messages
            .get(message_id)
            .ok_or_else(|| BackendError::NotFound(message_id.to_string()))?;
        if message.sender_id != requesting_user {
            return Err(BackendError::Forbidden(format!(
                "{} did not send {}",
                requesting_user, message_id
            )));
        }

        let key = message.conversation_key.clone();
        state.messages.remove(message_id);
        state.reactions.retain(|(mid, _), _| mid != message_id);
        state.publish(&key, RawChange::delete(MESSAGES_TABLE, json!({ "id": message_id })));
        Ok(())
    }

    async fn mark_read(&self, current_user: &str, counterpart: &str) -> BackendResult<()> {
        let mut state = self.state.write().await;
        state.take_failure(Call::MarkRead)?;
        Self::mark_read_locked(&mut state, current_user, counterpart);
        Ok(())
    }

    async fn upsert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        reaction: &str,
    ) -> BackendResult<Reaction> {
        let mut state = self.state.write().await;
        state.take_failure(Call::UpsertReaction)?;

        let key = state
            .messages
            .get(message_id)
            .map(|m| m.conversation_key.clone())
            .ok_or_else(|| BackendError::NotFound(message_id.to_string()))?;
        let row = Reaction {
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            reaction: reaction.to_string(),
            created_at: state.tick(),
        };
        let existed = state
            .reactions
            .insert((message_id.to_string(), user_id.to_string()), row.clone())
            .is_some();

        let change = if existed {
            RawChange::update(REACTIONS_TABLE, reaction_row(&row))
        } else {
            RawChange::insert(REACTIONS_TABLE, reaction_row(&row))
        };
        state.publish(&key, change);
        Ok(row)
    }

    async fn remove_reaction(&self, message_id: &str, user_id: &str) -> BackendResult<()> {
        let mut state = self.state.write().await;
        state.take_failure(Call::RemoveReaction)?;

        let removed = state
            .reactions
            .remove(&(message_id.to_string(), user_id.to_string()));
        let key = state.messages.get(message_id).map(|m| m.conversation_key.clone());
        if let (Some(row), Some(key)) = (removed, key) {
            state.publish(&key, RawChange::delete(REACTIONS_TABLE, reaction_row(&row)));
        }
        Ok(())
    }

    async fn subscribe(&self, current_user: &str) -> BackendResult<ChangeStream> {
        let mut state = self.state.write().await;
        state.take_failure(Call::Subscribe)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            user_id: current_user.to_string(),
            tx,
        });
        Ok(rx)
    }
}
