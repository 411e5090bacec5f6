/// Reaction aggregation
/// At most one reaction per (message, user); grouped by value for display
use crate::chat_types::Reaction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Display group: every user who reacted with the same value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub reaction: String,
    pub count: usize,
    pub user_ids: Vec<String>,
    /// The viewing user is among `user_ids`
    pub includes_me: bool,
}

/// Insert or replace the reaction of `reaction.user_id`. Returns the replaced row.
pub fn upsert(set: &mut Vec<Reaction>, reaction: Reaction) -> Option<Reaction> {
    match set.iter_mut().find(|r| r.user_id == reaction.user_id) {
        Some(slot) => Some(std::mem::replace(slot, reaction)),
        None => {
            set.push(reaction);
            None
        }
    }
}

/// Upsert unless the stored row of the same user is newer. Returns whether the set changed.
/// Push rows may arrive out of order; confirmations go through `upsert`.
pub fn upsert_newer(set: &mut Vec<Reaction>, reaction: Reaction) -> bool {
    match set.iter_mut().find(|r| r.user_id == reaction.user_id) {
        Some(slot) if slot.created_at > reaction.created_at => false,
        Some(slot) if *slot == reaction => false,
        Some(slot) => {
            *slot = reaction;
            true
        }
        None => {
            set.push(reaction);
            true
        }
    }
}

/// Drop the reaction of `user_id`, if any
pub fn remove(set: &mut Vec<Reaction>, user_id: &str) -> Option<Reaction> {
    let pos = set.iter().position(|r| r.user_id == user_id)?;
    Some(set.remove(pos))
}

pub fn user_reaction<'a>(set: &'a [Reaction], user_id: &str) -> Option<&'a Reaction> {
    set.iter().find(|r| r.user_id == user_id)
}

/// Fold `incoming` into `existing`; the most recent row wins per user
pub fn merge(existing: &mut Vec<Reaction>, incoming: Vec<Reaction>) {
    for reaction in incoming {
        upsert_newer(existing, reaction);
    }
}

/// Bucket a fetched batch by message id.
/// Duplicate (message, user) rows collapse to the most recent one.
pub fn group_by_message(rows: Vec<Reaction>) -> HashMap<String, Vec<Reaction>> {
    let mut grouped: HashMap<String, Vec<Reaction>> = HashMap::new();
    for row in rows {
        let set = grouped.entry(row.message_id.clone()).or_default();
        match set.iter_mut().find(|r| r.user_id == row.user_id) {
            Some(slot) if slot.created_at <= row.created_at => *slot = row,
            Some(_) => {}
            None => set.push(row),
        }
    }
    grouped
}

/// Group reactions by value, in order of first appearance
pub fn summarize(set: &[Reaction], current_user: &str) -> Vec<ReactionSummary> {
    let mut ordered: Vec<&Reaction> = set.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.user_id.cmp(&b.user_id)));

    let mut out: Vec<ReactionSummary> = Vec::new();
    for r in ordered {
        match out.iter_mut().find(|s| s.reaction == r.reaction) {
            Some(summary) => {
                summary.count += 1;
                summary.user_ids.push(r.user_id.clone());
                summary.includes_me |= r.user_id == current_user;
            }
            None => out.push(ReactionSummary {
                reaction: r.reaction.clone(),
                count: 1,
                user_ids: vec![r.user_id.clone()],
                includes_me: r.user_id == current_user,
            }),
        }
    }
    out
}
