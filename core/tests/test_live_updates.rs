/// Live update tests - waiting on the push channel, timeouts, notice fan-out
extern crate chatsync_core;

use chatsync_core::backend::{BroadcastNotifier, NoticeKind};
use chatsync_core::memory_backend::MemoryBackend;
use chatsync_core::push::ChannelState;
use chatsync_core::{ChatEngine, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_next_push_waits_for_delivery() {
    let backend = MemoryBackend::new();
    let mut alice = ChatEngine::new(backend.clone(), &Config::for_user("alice"));
    alice.start().await.unwrap();

    // Nothing queued yet
    assert!(timeout(Duration::from_millis(50), alice.next_push()).await.is_err());

    let msg = backend.deliver("bob", "alice", "wake up").await;
    let applied = timeout(Duration::from_secs(2), alice.next_push())
        .await
        .expect("push should arrive");
    assert_eq!(applied, Some(true));
    assert!(alice.messages().contains(&msg.id));
    assert_eq!(alice.channel().events_received(), 1);
}

#[tokio::test]
async fn test_next_push_ends_when_stream_closes() {
    let backend = MemoryBackend::new();
    let mut alice = ChatEngine::new(backend.clone(), &Config::for_user("alice"));
    alice.start().await.unwrap();

    backend.close_subscriptions().await;
    let result = timeout(Duration::from_secs(2), alice.next_push()).await.unwrap();
    assert_eq!(result, None);
    assert_eq!(alice.channel_state(), ChannelState::Error);
    assert_eq!(alice.channel().last_error(), Some("event stream closed"));
}

#[tokio::test]
async fn test_broadcast_notices_reach_subscribers() {
    let backend = MemoryBackend::new();
    let notifier = BroadcastNotifier::new(8);
    let mut notices = notifier.subscribe();
    let mut alice =
        ChatEngine::new(backend.clone(), &Config::for_user("alice")).with_notifier(Arc::new(notifier));
    alice.start().await.unwrap();

    backend.deliver("bob", "alice", "ping").await;
    alice.drain_push().await;

    let notice = timeout(Duration::from_secs(1), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.kind, NoticeKind::NewMessage);
    assert_eq!(notice.other_user_id.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_auto_read_can_be_disabled() {
    let backend = MemoryBackend::new();
    let mut config = Config::for_user("alice");
    config.auto_mark_read = false;
    let mut alice = ChatEngine::new(backend.clone(), &config);
    alice.start().await.unwrap();

    alice.open_conversation("bob").await.unwrap();
    backend.deliver("bob", "alice", "unread on purpose").await;
    alice.drain_push().await;

    assert_eq!(alice.directory().unread_for("bob"), 1);
    assert_eq!(alice.receipts().receipts_sent(), 0);
}
