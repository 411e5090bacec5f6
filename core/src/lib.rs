/// ChatSync - real-time chat synchronization engine
///
/// Keeps a per-user message log and conversation directory consistent across
/// optimistic local writes, backend confirmations and a best-effort push channel.

pub mod error;
pub mod config;
pub mod chat_types;
pub mod normalizer;
pub mod message_store;
pub mod reactions;
pub mod directory;
pub mod receipts;
pub mod push;
pub mod backend;
pub mod memory_backend;
pub mod history_cache;
pub mod engine;

pub use error::{BackendError, Result, SyncError};
pub use config::Config;
pub use chat_types::{ConversationKey, ConversationSummary, Message, Reaction};
pub use engine::ChatEngine;
