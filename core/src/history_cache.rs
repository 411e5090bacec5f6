/// Offline history cache: the session's message log persisted in sled
/// Lets the directory render before the first fetch. Pending sends are never cached.
use crate::chat_types::Message;
use crate::error::{Result, SyncError};
use std::path::Path;
use tracing::{debug, warn};

pub struct HistoryCache {
    db: sled::Db,
}

fn cache_key(msg: &Message) -> String {
    format!(
        "msg:{}:{:020}:{}",
        msg.conversation_key,
        msg.created_at.timestamp_millis().max(0),
        msg.id
    )
}

impl HistoryCache {
    /// Open the cache of `user_id` under `data_dir`
    pub fn open(data_dir: &Path, user_id: &str) -> Result<Self> {
        let file: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let db_path = data_dir.join(format!("history-{}.db", file));
        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open history cache: {}", e)))?;
        debug!("History cache opened at {:?}", db_path);
        Ok(Self { db })
    }

    /// Replace the cached log with `messages` in one atomic batch
    pub fn save_all<'a>(&self, messages: impl IntoIterator<Item = &'a Message>) -> Result<usize> {
        let mut batch = sled::Batch::default();
        for key in self.db.iter().keys() {
            let key =
                key.map_err(|e| SyncError::Storage(format!("Failed to read history cache: {}", e)))?;
            batch.remove(key);
        }

        let mut saved = 0;
        for msg in messages.into_iter().filter(|m| !m.is_pending()) {
            let value = serde_json::to_vec(msg).map_err(SyncError::Serialization)?;
            batch.insert(cache_key(msg).as_bytes(), value);
            saved += 1;
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| SyncError::Storage(format!("Failed to write history cache: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("Failed to flush history cache: {}", e)))?;
        Ok(saved)
    }

    /// Every cached message, ordered by conversation then (created_at, id)
    pub fn load(&self) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for entry in self.db.iter() {
            let (key, value) =
                entry.map_err(|e| SyncError::Storage(format!("Failed to read history cache: {}", e)))?;
            match serde_json::from_slice::<Message>(&value) {
                Ok(msg) => out.push(msg),
                Err(e) => warn!(
                    "Skipping undecodable cache entry {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(out)
    }

    pub fn count(&self) -> usize {
        self.db.len()
    }
}

impl Clone for HistoryCache {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}
