/// Conversation directory: one summary per counterpart, derived from the store
use crate::chat_types::{ConversationKey, ConversationSummary};
use crate::message_store::MessageStore;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

pub const DEFAULT_PLACEHOLDER_TEXT: &str = "No messages yet. Say hello!";

#[derive(Debug)]
pub struct ConversationDirectory {
    current_user: String,
    placeholder_text: String,
    summaries: HashMap<String, ConversationSummary>,
    /// Server-provided summaries for conversations whose history is not loaded
    seeds: HashMap<String, ConversationSummary>,
    /// Opened conversations that may have no messages yet
    placeholders: HashSet<String>,
}

impl ConversationDirectory {
    pub fn new(current_user: impl Into<String>) -> Self {
        Self::with_placeholder(current_user, DEFAULT_PLACEHOLDER_TEXT)
    }

    pub fn with_placeholder(current_user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            current_user: current_user.into(),
            placeholder_text: text.into(),
            summaries: HashMap::new(),
            seeds: HashMap::new(),
            placeholders: HashSet::new(),
        }
    }

    pub fn current_user(&self) -> &str {
        &self.current_user
    }

    /// Recompute the summaries of the given conversations from scratch
    pub fn refresh<'a>(
        &mut self,
        store: &MessageStore,
        keys: impl IntoIterator<Item = &'a ConversationKey>,
    ) {
        for key in keys {
            if let Some(other) = key.counterpart(&self.current_user) {
                let other = other.to_string();
                self.recompute(store, &other);
            }
        }
    }

    /// Recompute every summary
    pub fn rebuild(&mut self, store: &MessageStore) {
        let mut others: BTreeSet<String> = store
            .conversation_keys()
            .filter_map(|k| k.counterpart(&self.current_user))
            .map(str::to_string)
            .collect();
        others.extend(self.seeds.keys().cloned());
        others.extend(self.placeholders.iter().cloned());

        self.summaries.clear();
        for other in others {
            self.recompute(store, &other);
        }
        debug!("Directory rebuilt: {} conversations", self.summaries.len());
    }

    /// Install server summaries, replacing earlier seeds
    pub fn seed(&mut self, store: &MessageStore, summaries: Vec<ConversationSummary>) {
        self.seeds = summaries
            .into_iter()
            .filter(|s| s.other_user_id != self.current_user)
            .map(|s| (s.other_user_id.clone(), s))
            .collect();
        self.rebuild(store);
    }

    /// Make sure an opened conversation has something to render
    pub fn ensure_placeholder(&mut self, store: &MessageStore, other_user_id: &str) {
        self.placeholders.insert(other_user_id.to_string());
        self.recompute(store, other_user_id);
    }

    /// Zero the server-side unread baseline after a read receipt went through
    pub fn clear_seeded_unread(&mut self, store: &MessageStore, other_user_id: &str) {
        if let Some(seed) = self.seeds.get_mut(other_user_id) {
            seed.unread_count = 0;
        }
        self.recompute(store, other_user_id);
    }

    pub fn get(&self, other_user_id: &str) -> Option<&ConversationSummary> {
        self.summaries.get(other_user_id)
    }

    pub fn unread_for(&self, other_user_id: &str) -> u32 {
        self.get(other_user_id).map(|s| s.unread_count).unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.summaries.values().map(|s| s.unread_count).sum()
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    /// Newest first; placeholders lead since they were just opened
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self.summaries.values().cloned().collect();
        out.sort_by(|a, b| {
            let ka = (a.last_message_timestamp.is_none(), a.last_message_timestamp);
            let kb = (b.last_message_timestamp.is_none(), b.last_message_timestamp);
            Reverse(ka)
                .cmp(&Reverse(kb))
                .then_with(|| a.other_user_id.cmp(&b.other_user_id))
        });
        out
    }

    pub fn clear(&mut self) {
        self.summaries.clear();
        self.seeds.clear();
        self.placeholders.clear();
    }

    fn recompute(&mut self, store: &MessageStore, other: &str) {
        let key = ConversationKey::between(&self.current_user, other);
        let me = self.current_user.as_str();
        let latest = store.latest(&key);

        let summary = match self.seeds.get(other) {
            Some(seed) if !store.is_loaded(&key) => {
                let newer = store
                    .list_by_conversation(&key)
                    .filter(|m| seed.last_message_timestamp.map_or(true, |ts| m.created_at > ts));
                let unread_newer = newer.clone().filter(|m| m.is_unread_for(me)).count() as u32;
                match newer.last() {
                    Some(m) => Some(ConversationSummary {
                        other_user_id: other.to_string(),
                        last_message_text: m.text.clone(),
                        last_message_timestamp: Some(m.created_at),
                        unread_count: seed.unread_count + unread_newer,
                    }),
                    None => Some(seed.clone()),
                }
            }
            _ => match latest {
                Some(m) => Some(ConversationSummary {
                    other_user_id: other.to_string(),
                    last_message_text: m.text.clone(),
                    last_message_timestamp: Some(m.created_at),
                    unread_count: store
                        .list_by_conversation(&key)
                        .filter(|m| m.is_unread_for(me))
                        .count() as u32,
                }),
                None if self.placeholders.contains(other) => Some(ConversationSummary {
                    other_user_id: other.to_string(),
                    last_message_text: self.placeholder_text.clone(),
                    last_message_timestamp: None,
                    unread_count: 0,
                }),
                None => None,
            },
        };

        match summary {
            Some(s) => {
                self.summaries.insert(other.to_string(), s);
            }
            None => {
                self.summaries.remove(other);
            }
        }
    }
}
