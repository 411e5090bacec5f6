/// Chat sync integration tests
/// Two or more sessions share one in-process backend and exchange pushes through it
extern crate chatsync_core;

use chatsync_core::backend::{ChatBackend, Notice, NoticeKind, Notifier};
use chatsync_core::engine::ReactionChange;
use chatsync_core::memory_backend::{Call, MemoryBackend};
use chatsync_core::normalizer::SyncEvent;
use chatsync_core::push::ChannelState;
use chatsync_core::{BackendError, ChatEngine, Config, Message, Reaction, SyncError};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    fn kinds(&self) -> Vec<NoticeKind> {
        self.notices.lock().unwrap().iter().map(|n| n.kind).collect()
    }

    fn texts(&self) -> Vec<String> {
        self.notices.lock().unwrap().iter().map(|n| n.text.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600, 0).unwrap()
}

async fn session(backend: &MemoryBackend, user: &str) -> ChatEngine<MemoryBackend> {
    let mut engine = ChatEngine::new(backend.clone(), &Config::for_user(user));
    engine.start().await.unwrap();
    engine
}

async fn recorded_session(
    backend: &MemoryBackend,
    user: &str,
) -> (ChatEngine<MemoryBackend>, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let mut engine =
        ChatEngine::new(backend.clone(), &Config::for_user(user)).with_notifier(notifier.clone());
    engine.start().await.unwrap();
    (engine, notifier)
}

fn ids(engine: &ChatEngine<MemoryBackend>, other: &str) -> Vec<String> {
    engine.conversation(other).map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn test_send_then_duplicate_push_collapses() {
    let backend = MemoryBackend::with_clock(t0());
    let mut u1 = session(&backend, "u1").await;
    let mut u2 = session(&backend, "u2").await;

    let sent = u1.send_message("u2", "hi").await.unwrap();
    assert_eq!(sent.id, "m100");
    assert_eq!(ids(&u1, "u2"), vec!["m100"]);

    // Self-originated push for the same id arrives afterwards
    u1.drain_push().await;
    assert_eq!(ids(&u1, "u2"), vec!["m100"]);
    assert_eq!(u1.messages().get("m100").unwrap().text, "hi");

    u2.drain_push().await;
    let summary = u2.directory().get("u1").unwrap();
    assert_eq!(summary.last_message_text, "hi");
    assert_eq!(summary.last_message_timestamp, Some(sent.created_at));
    assert_eq!(summary.unread_count, 1);
}

#[tokio::test]
async fn test_push_before_confirmation_leaves_one_message() {
    let backend = MemoryBackend::with_clock(t0());
    let mut u1 = session(&backend, "u1").await;

    let pending = u1.begin_send("u2", "hi", None);
    assert!(u1.messages().get(&pending.temp_id).unwrap().is_pending());

    let result = ChatBackend::send_message(&backend, &pending.outgoing).await;
    u1.drain_push().await;
    assert_eq!(u1.conversation("u2").count(), 2);

    let stored = u1.finish_send(pending, result).await.unwrap();
    assert_eq!(ids(&u1, "u2"), vec![stored.id.clone()]);
    assert!(u1.conversation("u2").all(|m| !m.is_pending()));
    assert_eq!(u1.directory().get("u2").unwrap().last_message_text, "hi");
}

#[tokio::test]
async fn test_listing_order_ignores_arrival_order() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;

    let late = Message::new("m3", "bob", "alice", "third", t0() + Duration::seconds(30));
    let early = Message::new("m1", "bob", "alice", "first", t0() + Duration::seconds(10));
    let mid = Message::new("m2", "alice", "bob", "second", t0() + Duration::seconds(20));
    alice.apply_event(SyncEvent::MessageAdded(late));
    alice.apply_event(SyncEvent::MessageChanged(mid));
    alice.apply_event(SyncEvent::MessageAdded(early));

    assert_eq!(ids(&alice, "bob"), vec!["m1", "m2", "m3"]);
    assert_eq!(alice.directory().get("bob").unwrap().last_message_text, "third");
}

#[tokio::test]
async fn test_reaction_replaces_previous_value() {
    let backend = MemoryBackend::with_clock(t0());
    let mut u1 = session(&backend, "u1").await;
    let mut u2 = session(&backend, "u2").await;

    let sent = u1.send_message("u2", "ship it?").await.unwrap();
    u2.open_conversation("u1").await.unwrap();

    u2.apply_reaction(&sent.id, "👍").await.unwrap();
    u2.apply_reaction(&sent.id, "❤️").await.unwrap();

    let reactions = &u2.messages().get(&sent.id).unwrap().reactions;
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[0].reaction, "❤️");

    u1.drain_push().await;
    let seen = u1.reaction_summary(&sent.id);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].reaction, "❤️");
    assert_eq!(seen[0].user_ids, vec!["u2"]);
    assert!(!seen[0].includes_me);
}

#[tokio::test]
async fn test_same_reaction_twice_toggles_off() {
    let backend = MemoryBackend::with_clock(t0());
    let mut u1 = session(&backend, "u1").await;

    let sent = u1.send_message("u2", "lunch?").await.unwrap();
    u1.apply_reaction(&sent.id, "🍕").await.unwrap();
    assert_eq!(u1.reaction_summary(&sent.id).len(), 1);

    let removed = u1.apply_reaction(&sent.id, "🍕").await.unwrap();
    assert!(removed.is_none());
    assert!(u1.reaction_summary(&sent.id).is_empty());
    assert!(backend.message(&sent.id).await.unwrap().reactions.is_empty());
}

#[tokio::test]
async fn test_mark_read_converges_unread_counts() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;

    for text in ["one", "two", "three"] {
        backend.deliver("bob", "alice", text).await;
    }
    backend.deliver("carol", "alice", "ping").await;
    alice.drain_push().await;
    assert_eq!(alice.directory().unread_for("bob"), 3);
    let before = alice.directory().total_unread();
    assert_eq!(before, 4);

    let marked = alice.mark_read("bob").await.unwrap();
    assert_eq!(marked, 3);
    assert_eq!(alice.directory().unread_for("bob"), 0);
    assert_eq!(alice.directory().total_unread(), before - 3);

    // Idempotent
    assert_eq!(alice.mark_read("bob").await.unwrap(), 0);
    assert_eq!(alice.directory().total_unread(), 1);
}

#[tokio::test]
async fn test_mark_read_clears_seeded_unread() {
    let backend = MemoryBackend::with_clock(t0());
    backend.deliver("bob", "alice", "are you around?").await;
    backend.deliver("bob", "alice", "need a review").await;

    let mut alice = session(&backend, "alice").await;
    assert_eq!(alice.directory().unread_for("bob"), 2);
    assert!(alice.conversation("bob").next().is_none());

    alice.mark_read("bob").await.unwrap();
    assert_eq!(alice.directory().unread_for("bob"), 0);
    assert_eq!(
        alice.directory().get("bob").unwrap().last_message_text,
        "need a review"
    );
}

#[tokio::test]
async fn test_opening_conversation_sends_receipt_and_clears_unread() {
    let backend = MemoryBackend::with_clock(t0());
    let (mut alice, notices) = recorded_session(&backend, "alice").await;

    backend.deliver("bob", "alice", "hello").await;
    alice.drain_push().await;
    assert_eq!(alice.directory().unread_for("bob"), 1);
    assert_eq!(notices.kinds(), vec![NoticeKind::NewMessage]);

    alice.open_conversation("bob").await.unwrap();
    assert_eq!(alice.directory().unread_for("bob"), 0);

    // Messages arriving in the active conversation are read on arrival
    backend.deliver("bob", "alice", "still there?").await;
    alice.drain_push().await;
    assert_eq!(alice.directory().unread_for("bob"), 0);
    assert!(alice.conversation("bob").all(|m| m.is_read));
    assert_eq!(notices.kinds(), vec![NoticeKind::NewMessage]);
    assert!(backend.calls().await.contains(&Call::MarkRead));
}

#[tokio::test]
async fn test_new_message_notice_uses_display_name() {
    let backend = MemoryBackend::with_clock(t0());
    let notifier = Arc::new(RecordingNotifier::default());
    let mut names = HashMap::new();
    names.insert("bob".to_string(), "Bob Builder".to_string());
    let mut alice = ChatEngine::new(backend.clone(), &Config::for_user("alice"))
        .with_notifier(notifier.clone())
        .with_user_lookup(Arc::new(names));
    alice.start().await.unwrap();

    backend.deliver("bob", "alice", "hey").await;
    alice.drain_push().await;
    assert_eq!(notifier.texts(), vec!["New message from Bob Builder".to_string()]);
}

#[tokio::test]
async fn test_delete_and_duplicate_remote_delete() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;

    let keep = alice.send_message("bob", "keep").await.unwrap();
    let gone = alice.send_message("bob", "oops").await.unwrap();
    alice.drain_push().await;

    alice.delete_message(&gone.id).await.unwrap();
    assert_eq!(ids(&alice, "bob"), vec![keep.id.clone()]);
    assert_eq!(alice.directory().get("bob").unwrap().last_message_text, "keep");

    // The push echo of our own delete is a no-op
    assert_eq!(alice.drain_push().await, 0);
    assert!(!alice.apply_event(SyncEvent::MessageRemoved(gone.id.clone())));
    assert_eq!(ids(&alice, "bob"), vec![keep.id]);
}

#[tokio::test]
async fn test_remote_delete_from_counterpart() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;
    let mut bob = session(&backend, "bob").await;

    let msg = bob.send_message("alice", "wrong chat").await.unwrap();
    alice.drain_push().await;
    assert_eq!(alice.directory().unread_for("bob"), 1);

    bob.delete_message(&msg.id).await.unwrap();
    alice.drain_push().await;
    assert!(alice.messages().get(&msg.id).is_none());
    assert!(alice.directory().get("bob").is_none());
}

#[tokio::test]
async fn test_stale_fetch_is_discarded() {
    let backend = MemoryBackend::with_clock(t0());
    backend.deliver("bob", "alice", "from bob").await;
    backend.deliver("carol", "alice", "from carol").await;
    let mut alice = session(&backend, "alice").await;

    let ticket_bob = alice.begin_open("bob");
    let history_bob = alice.fetch_history("bob").await;
    let ticket_carol = alice.begin_open("carol");
    let history_carol = alice.fetch_history("carol").await;

    assert!(alice.finish_open(ticket_carol, history_carol).unwrap());
    assert!(!alice.finish_open(ticket_bob, history_bob).unwrap());

    assert_eq!(alice.active_conversation(), Some("carol"));
    assert_eq!(alice.conversation("carol").count(), 1);
    assert_eq!(alice.conversation("bob").count(), 0);
}

#[tokio::test]
async fn test_push_during_history_fetch_survives_install() {
    let backend = MemoryBackend::with_clock(t0());
    let old = backend.deliver("bob", "alice", "old").await;
    let gone = backend.deliver("bob", "alice", "about to vanish").await;
    let mut alice = session(&backend, "alice").await;

    let ticket = alice.begin_open("bob");
    let history = alice.fetch_history("bob").await;

    // Live traffic applied before the snapshot is installed
    let live = backend.deliver("bob", "alice", "new").await;
    ChatBackend::delete_message(&backend, &gone.id, "bob").await.unwrap();
    alice.drain_push().await;
    assert!(alice.messages().contains(&live.id));

    assert!(alice.finish_open(ticket, history).unwrap());
    assert_eq!(ids(&alice, "bob"), vec![old.id, live.id]);
    assert_eq!(alice.directory().get("bob").unwrap().last_message_text, "new");
    assert!(alice.messages().get(&gone.id).is_none());
}

#[tokio::test]
async fn test_out_of_order_reaction_push_keeps_latest() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;
    let msg = alice.send_message("bob", "lunch?").await.unwrap();

    let row = |value: &str, secs: i64| Reaction {
        message_id: msg.id.clone(),
        user_id: "bob".to_string(),
        reaction: value.to_string(),
        created_at: t0() + Duration::seconds(secs),
    };
    assert!(alice.apply_event(SyncEvent::ReactionUpserted(row("❤️", 10))));
    assert!(!alice.apply_event(SyncEvent::ReactionUpserted(row("👍", 5))));

    let summary = alice.reaction_summary(&msg.id);
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].reaction, "❤️");
}

#[tokio::test]
async fn test_read_receipt_in_flight_is_not_duplicated() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;
    backend.deliver("bob", "alice", "one").await;
    backend.deliver("bob", "alice", "two").await;
    alice.drain_push().await;

    let pending = alice.begin_mark_read("bob").unwrap();
    assert!(alice.receipts().is_in_flight("bob"));
    assert!(alice.begin_mark_read("bob").is_none());
    // Coalesced: the async path does not reach the backend either
    assert_eq!(alice.mark_read("bob").await.unwrap(), 0);
    assert!(!backend.calls().await.contains(&Call::MarkRead));

    let result = ChatBackend::mark_read(&backend, "alice", "bob").await;
    assert_eq!(alice.finish_mark_read(pending, result).unwrap(), 2);
    assert_eq!(alice.directory().unread_for("bob"), 0);
    assert!(!alice.receipts().is_in_flight("bob"));
    assert_eq!(alice.receipts().receipts_sent(), 1);
    assert!(alice.begin_mark_read("bob").is_some());
}

#[tokio::test]
async fn test_failed_read_receipt_releases_claim() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;
    backend.deliver("bob", "alice", "hello?").await;
    alice.drain_push().await;

    backend
        .fail_next(Call::MarkRead, BackendError::Network("offline".into()))
        .await;
    assert!(alice.mark_read("bob").await.is_err());
    assert_eq!(alice.directory().unread_for("bob"), 1);
    assert!(!alice.receipts().is_in_flight("bob"));
    assert_eq!(alice.mark_read("bob").await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_load_keeps_local_state() {
    let backend = MemoryBackend::with_clock(t0());
    let (mut alice, notices) = recorded_session(&backend, "alice").await;
    let sent = alice.send_message("bob", "hi").await.unwrap();

    backend
        .fail_next(Call::FetchMessages, BackendError::Network("timeout".into()))
        .await;
    let err = alice.open_conversation("bob").await.unwrap_err();
    assert!(matches!(err, SyncError::Load(_)));
    assert_eq!(ids(&alice, "bob"), vec![sent.id]);
    assert!(notices.kinds().contains(&NoticeKind::LoadError));
}

#[tokio::test]
async fn test_failed_send_rolls_back_and_notifies() {
    let backend = MemoryBackend::with_clock(t0());
    let (mut alice, notices) = recorded_session(&backend, "alice").await;
    alice.send_message("bob", "first").await.unwrap();

    backend
        .fail_next(Call::Send, BackendError::Network("offline".into()))
        .await;
    let err = alice.send_message("bob", "second").await.unwrap_err();

    assert!(matches!(err, SyncError::Network(_)));
    assert_eq!(alice.conversation("bob").count(), 1);
    assert!(alice.conversation("bob").all(|m| !m.is_pending()));
    assert_eq!(alice.directory().get("bob").unwrap().last_message_text, "first");
    assert_eq!(notices.kinds(), vec![NoticeKind::Failure]);
    // Rollback refetches the conversation
    assert!(backend.calls().await.contains(&Call::FetchMessages));
}

#[tokio::test]
async fn test_editing_someone_elses_message_is_refused_locally() {
    let backend = MemoryBackend::with_clock(t0());
    let (mut alice, notices) = recorded_session(&backend, "alice").await;
    let msg = backend.deliver("bob", "alice", "original").await;
    alice.drain_push().await;

    let err = alice.edit_message(&msg.id, "tampered").await.unwrap_err();
    assert!(err.is_permission());
    assert_eq!(alice.messages().get(&msg.id).unwrap().text, "original");
    assert!(notices.kinds().contains(&NoticeKind::PermissionDenied));
    assert!(!backend.calls().await.contains(&Call::Edit));

    let err = alice.delete_message(&msg.id).await.unwrap_err();
    assert!(err.is_permission());
    assert!(alice.messages().contains(&msg.id));
}

#[tokio::test]
async fn test_rejected_edit_is_reverted() {
    let backend = MemoryBackend::with_clock(t0());
    let (mut alice, notices) = recorded_session(&backend, "alice").await;
    let msg = alice.send_message("bob", "draft").await.unwrap();

    let pending = alice.begin_edit(&msg.id, "final").unwrap();
    assert_eq!(alice.messages().get(&msg.id).unwrap().text, "final");

    let result = Err(BackendError::Forbidden("not yours".into()));
    let err = alice.finish_edit(pending, result).await.unwrap_err();
    assert!(err.is_permission());
    assert_eq!(alice.messages().get(&msg.id).unwrap().text, "draft");
    assert_eq!(notices.kinds(), vec![NoticeKind::PermissionDenied]);
}

#[tokio::test]
async fn test_successful_edit_propagates() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;
    let mut bob = session(&backend, "bob").await;

    let msg = alice.send_message("bob", "meeting at 3").await.unwrap();
    bob.drain_push().await;

    let edited = alice.edit_message(&msg.id, "meeting at 4").await.unwrap();
    assert!(edited.updated_at.is_some());
    bob.drain_push().await;

    let seen = bob.messages().get(&msg.id).unwrap();
    assert_eq!(seen.text, "meeting at 4");
    assert_eq!(bob.directory().get("alice").unwrap().last_message_text, "meeting at 4");
}

#[tokio::test]
async fn test_failed_delete_restores_message() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;
    let msg = alice.send_message("bob", "important").await.unwrap();

    backend
        .fail_next(Call::Delete, BackendError::Network("offline".into()))
        .await;
    assert!(alice.delete_message(&msg.id).await.is_err());
    assert_eq!(ids(&alice, "bob"), vec![msg.id]);
}

#[tokio::test]
async fn test_failed_reaction_reverts_via_refetch() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;
    let msg = alice.send_message("bob", "vote").await.unwrap();
    alice.apply_reaction(&msg.id, "👍").await.unwrap();

    backend
        .fail_next(Call::UpsertReaction, BackendError::Network("offline".into()))
        .await;
    assert!(alice.apply_reaction(&msg.id, "👎").await.is_err());

    let summary = alice.reaction_summary(&msg.id);
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].reaction, "👍");
}

#[tokio::test]
async fn test_failed_reaction_restores_locally_when_refetch_fails() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;
    let msg = alice.send_message("bob", "vote").await.unwrap();

    let pending = alice
        .begin_reaction(&msg.id, ReactionChange::Set("🎉".into()))
        .unwrap();
    assert_eq!(alice.reaction_summary(&msg.id).len(), 1);

    backend
        .fail_next(Call::FetchReactions, BackendError::Network("offline".into()))
        .await;
    let result = Err(BackendError::Network("offline".into()));
    assert!(alice.finish_reaction(pending, result).await.is_err());
    assert!(alice.reaction_summary(&msg.id).is_empty());
}

#[tokio::test]
async fn test_channel_error_and_reconnect() {
    let backend = MemoryBackend::with_clock(t0());
    let (mut alice, notices) = recorded_session(&backend, "alice").await;
    assert_eq!(alice.channel_state(), ChannelState::Subscribed);

    backend.close_subscriptions().await;
    alice.drain_push().await;
    alice.drain_push().await;
    assert_eq!(alice.channel_state(), ChannelState::Error);
    assert_eq!(notices.kinds(), vec![NoticeKind::ChannelError]);

    alice.reconnect().await.unwrap();
    assert_eq!(alice.channel_state(), ChannelState::Subscribed);
    assert!(alice.reconnect().await.is_err());

    backend.deliver("bob", "alice", "back online?").await;
    assert_eq!(alice.drain_push().await, 1);

    alice.logout();
    assert_eq!(alice.channel_state(), ChannelState::Disconnected);
    assert!(alice.messages().is_empty());
}

#[tokio::test]
async fn test_subscribe_failure_leaves_channel_in_error() {
    let backend = MemoryBackend::with_clock(t0());
    backend
        .fail_next(Call::Subscribe, BackendError::Network("refused".into()))
        .await;
    let mut alice = ChatEngine::new(backend.clone(), &Config::for_user("alice"));

    assert!(matches!(alice.start().await, Err(SyncError::Channel(_))));
    assert_eq!(alice.channel_state(), ChannelState::Error);
    alice.reconnect().await.unwrap();
    assert_eq!(alice.channel_state(), ChannelState::Subscribed);
}

#[tokio::test]
async fn test_malformed_push_is_dropped() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;

    let mut bogus = chatsync_core::normalizer::RawChange::insert(
        "messages",
        serde_json::json!({ "id": "x" }),
    );
    backend.push_raw("alice", bogus.clone()).await;
    bogus.op = "truncate".to_string();
    backend.push_raw("alice", bogus).await;

    assert_eq!(alice.drain_push().await, 0);
    assert!(alice.messages().is_empty());
    assert_eq!(alice.channel_state(), ChannelState::Subscribed);
}

#[tokio::test]
async fn test_foreign_conversation_events_are_ignored() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;

    let foreign = Message::new("m1", "bob", "carol", "not for alice", t0());
    assert!(!alice.apply_event(SyncEvent::MessageAdded(foreign)));
    assert!(alice.messages().is_empty());
}

#[tokio::test]
async fn test_placeholder_for_new_conversation() {
    let backend = MemoryBackend::with_clock(t0());
    let mut alice = session(&backend, "alice").await;

    alice.open_conversation("dave").await.unwrap();
    let dave = alice.directory().get("dave").unwrap();
    assert!(dave.is_placeholder());
    assert_eq!(dave.unread_count, 0);

    alice.send_message("dave", "welcome aboard").await.unwrap();
    let dave = alice.directory().get("dave").unwrap();
    assert!(!dave.is_placeholder());
    assert_eq!(dave.last_message_text, "welcome aboard");
}

#[tokio::test]
async fn test_history_cache_survives_logout() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::with_clock(t0());
    let mut config = Config::for_user("alice");
    config.data_dir = Some(dir.path().to_path_buf());

    let mut alice = ChatEngine::new(backend.clone(), &config);
    alice.start().await.unwrap();
    alice.send_message("bob", "see you tomorrow").await.unwrap();
    alice.logout();
    drop(alice);

    backend
        .fail_next(Call::FetchConversations, BackendError::Network("offline".into()))
        .await;
    let mut again = ChatEngine::new(backend.clone(), &config);
    again.start().await.unwrap();
    assert_eq!(
        again.directory().get("bob").unwrap().last_message_text,
        "see you tomorrow"
    );
}
