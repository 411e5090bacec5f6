/// ChatSync demo session - runs the engine against the in-process backend
use chatsync_core::backend::{BroadcastNotifier, ChatBackend};
use chatsync_core::memory_backend::MemoryBackend;
use chatsync_core::{ChatEngine, Config};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let mut config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if config.contacts.is_empty() {
        config.contacts.push("teammate".to_string());
    }

    let backend = MemoryBackend::new();
    let notifier = BroadcastNotifier::new(config.notice_capacity);
    let mut notices = notifier.subscribe();
    let names: HashMap<String, String> = config
        .contacts
        .iter()
        .map(|c| (c.clone(), format!("@{}", c)))
        .collect();

    let mut engine = ChatEngine::new(backend.clone(), &config)
        .with_notifier(Arc::new(notifier))
        .with_user_lookup(Arc::new(names));

    info!("Starting chat session for {}", config.user_id);
    engine.start().await
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;

    // Each contact writes first, then we open the conversation and reply
    for contact in &config.contacts {
        backend.deliver(contact, &config.user_id, "Morning! Did the standup notes go out?").await;
    }
    engine.drain_push().await;
    info!("Unread before opening: {}", engine.directory().total_unread());

    for contact in config.contacts.clone() {
        engine.open_conversation(&contact).await
            .map_err(|e| anyhow::anyhow!("Open error: {}", e))?;
        let sent = engine.send_message(&contact, "Yes, sent them to the team channel").await
            .map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        engine.apply_reaction(&sent.id, "👍").await
            .map_err(|e| anyhow::anyhow!("Reaction error: {}", e))?;
        engine.drain_push().await;
    }

    for summary in engine.directory().list() {
        info!(
            "{:<16} unread={} last={:?}",
            summary.other_user_id, summary.unread_count, summary.last_message_text
        );
    }
    while let Ok(notice) = notices.try_recv() {
        info!("notice [{:?}] {}", notice.kind, notice.text);
    }

    let summaries = backend.fetch_conversations(&config.user_id).await
        .map_err(|e| anyhow::anyhow!("Backend error: {}", e))?;
    info!("Server holds {} conversations for {}", summaries.len(), config.user_id);

    engine.logout();
    Ok(())
}
