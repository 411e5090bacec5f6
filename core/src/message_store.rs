/// Message store: ordered, deduplicated messages per conversation
/// `id` is the only deduplication key; listings follow (created_at, id)
use crate::chat_types::{ConversationKey, Message, Reaction};
use crate::reactions;
use chrono::{DateTime, Utc};
use std::collections::{btree_set, BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

type OrderKey = (DateTime<Utc>, String);

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    /// Id was unseen
    Inserted,
    /// Existing entry changed
    Merged,
    /// Incoming record carried nothing new
    Unchanged,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: HashMap<String, Message>,
    index: BTreeMap<ConversationKey, BTreeSet<OrderKey>>,
    /// Conversations whose authoritative history has been installed
    loaded: HashSet<ConversationKey>,
    /// Conversations touched since the last directory refresh
    dirty: BTreeSet<ConversationKey>,
    /// Bumped on every local change; history snapshots are stamped with it
    seq: u64,
    /// Sequence of the last change per stored id
    changed: HashMap<String, u64>,
    /// Ids removed at a given sequence, kept until a newer snapshot of their conversation lands
    removed: HashMap<String, (ConversationKey, u64)>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if unseen, otherwise merge into the existing entry.
    /// Incoming wins on scalar fields; reactions are merged per user.
    pub fn upsert(&mut self, incoming: Message) -> Upserted {
        let Some(existing) = self.messages.get(&incoming.id) else {
            self.touch(&incoming.id);
            self.removed.remove(&incoming.id);
            self.insert_new(incoming);
            return Upserted::Inserted;
        };

        let mut merged = incoming;
        let mut reactions = existing.reactions.clone();
        reactions::merge(&mut reactions, std::mem::take(&mut merged.reactions));
        merged.reactions = reactions;

        if &merged == existing {
            return Upserted::Unchanged;
        }

        let old_key = existing.conversation_key.clone();
        let old_order = (existing.created_at, existing.id.clone());
        if old_key != merged.conversation_key || old_order.0 != merged.created_at {
            self.unindex(&old_key, &old_order);
            self.dirty.insert(old_key);
            self.index_entry(&merged);
        }

        self.dirty.insert(merged.conversation_key.clone());
        self.touch(&merged.id);
        self.messages.insert(merged.id.clone(), merged);
        Upserted::Merged
    }

    /// Hard removal. Absent ids are a no-op.
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let removed = self.messages.remove(id)?;
        self.unindex(
            &removed.conversation_key,
            &(removed.created_at, removed.id.clone()),
        );
        self.dirty.insert(removed.conversation_key.clone());
        self.seq += 1;
        self.changed.remove(id);
        self.removed
            .insert(removed.id.clone(), (removed.conversation_key.clone(), self.seq));
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages of one conversation in (created_at, id) order.
    /// The iterator is lazy and can be cloned to restart from the same point.
    pub fn list_by_conversation(&self, key: &ConversationKey) -> ConversationIter<'_> {
        ConversationIter {
            order: self.index.get(key).map(|set| set.iter()),
            messages: &self.messages,
        }
    }

    /// Newest message of a conversation by (created_at, id)
    pub fn latest(&self, key: &ConversationKey) -> Option<&Message> {
        self.list_by_conversation(key).next_back()
    }

    pub fn conversation_keys(&self) -> impl Iterator<Item = &ConversationKey> + '_ {
        self.index.keys()
    }

    /// Every stored message, unordered
    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        self.messages.values()
    }

    pub fn is_loaded(&self, key: &ConversationKey) -> bool {
        self.loaded.contains(key)
    }

    /// Current change sequence. Take it before fetching a snapshot.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Install an authoritative history for `key` fetched when the store was at `since`.
    /// Entries changed after `since` keep their local state, ids removed after `since`
    /// stay removed, and pending sends survive. Everything else follows `history`.
    pub fn replace_conversation(
        &mut self,
        key: &ConversationKey,
        history: Vec<Message>,
        since: u64,
    ) {
        let incoming: HashSet<&str> = history.iter().map(|m| m.id.as_str()).collect();
        let stale: Vec<String> = self
            .list_by_conversation(key)
            .filter(|m| !m.is_pending() && !incoming.contains(m.id.as_str()))
            .filter(|m| !self.changed_since(&m.id, since))
            .map(|m| m.id.clone())
            .collect();
        drop(incoming);

        for id in &stale {
            self.drop_entry(id);
        }
        if !stale.is_empty() {
            debug!("Dropped {} stale messages from {}", stale.len(), key);
        }

        let mut kept = 0;
        for message in history {
            let removed_later = self
                .removed
                .get(&message.id)
                .is_some_and(|(_, at)| *at > since);
            if removed_later || self.changed_since(&message.id, since) {
                kept += 1;
                continue;
            }
            self.drop_entry(&message.id);
            self.changed.insert(message.id.clone(), self.seq);
            self.insert_new(message);
        }
        if kept > 0 {
            debug!("Kept {} entries of {} changed after the snapshot", kept, key);
        }

        self.removed.retain(|_, (k, at)| *k != *key || *at > since);
        self.loaded.insert(key.clone());
        self.dirty.insert(key.clone());
    }

    /// Run `f` on the reaction set of `message_id`. None if the message is unknown.
    pub fn update_reactions<R>(
        &mut self,
        message_id: &str,
        f: impl FnOnce(&mut Vec<Reaction>) -> R,
    ) -> Option<R> {
        let message = self.messages.get_mut(message_id)?;
        let out = f(&mut message.reactions);
        self.dirty.insert(message.conversation_key.clone());
        self.touch(message_id);
        Some(out)
    }

    /// Flip `is_read` on messages `sender` sent to `receiver`. Returns how many changed.
    pub fn mark_read(&mut self, sender: &str, receiver: &str) -> usize {
        let key = ConversationKey::between(sender, receiver);
        let ids: Vec<String> = self
            .list_by_conversation(&key)
            .filter(|m| m.sender_id == sender && m.is_unread_for(receiver))
            .map(|m| m.id.clone())
            .collect();

        for id in &ids {
            if let Some(message) = self.messages.get_mut(id) {
                message.is_read = true;
            }
            self.touch(id);
        }
        if !ids.is_empty() {
            self.dirty.insert(key);
        }
        ids.len()
    }

    /// Conversations changed since the last call
    pub fn take_dirty(&mut self) -> BTreeSet<ConversationKey> {
        std::mem::take(&mut self.dirty)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.loaded.clear();
        self.dirty.clear();
        self.changed.clear();
        self.removed.clear();
    }

    fn touch(&mut self, id: &str) {
        self.seq += 1;
        self.changed.insert(id.to_string(), self.seq);
    }

    fn changed_since(&self, id: &str, since: u64) -> bool {
        self.changed.get(id).is_some_and(|at| *at > since)
    }

    /// Unindex and forget an entry without logging a removal
    fn drop_entry(&mut self, id: &str) {
        if let Some(existing) = self.messages.remove(id) {
            self.unindex(
                &existing.conversation_key,
                &(existing.created_at, existing.id.clone()),
            );
            self.dirty.insert(existing.conversation_key);
        }
        self.changed.remove(id);
    }

    fn insert_new(&mut self, message: Message) {
        self.index_entry(&message);
        self.dirty.insert(message.conversation_key.clone());
        self.messages.insert(message.id.clone(), message);
    }

    fn index_entry(&mut self, message: &Message) {
        self.index
            .entry(message.conversation_key.clone())
            .or_default()
            .insert((message.created_at, message.id.clone()));
    }

    fn unindex(&mut self, key: &ConversationKey, order: &OrderKey) {
        if let Some(set) = self.index.get_mut(key) {
            set.remove(order);
            if set.is_empty() {
                self.index.remove(key);
            }
        }
    }
}

/// Ordered view over one conversation
#[derive(Clone)]
pub struct ConversationIter<'a> {
    order: Option<btree_set::Iter<'a, OrderKey>>,
    messages: &'a HashMap<String, Message>,
}

impl<'a> Iterator for ConversationIter<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, id) = self.order.as_mut()?.next()?;
            if let Some(message) = self.messages.get(id) {
                return Some(message);
            }
        }
    }
}

impl DoubleEndedIterator for ConversationIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        loop {
            let (_, id) = self.order.as_mut()?.next_back()?;
            if let Some(message) = self.messages.get(id) {
                return Some(message);
            }
        }
    }
}
