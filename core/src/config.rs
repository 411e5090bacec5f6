/// Configuration management
use crate::directory::DEFAULT_PLACEHOLDER_TEXT;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_NOTICE_CAPACITY: usize = 64;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logged-in user
    pub user_id: String,

    /// Counterparts to open on start (demo binary)
    pub contacts: Vec<String>,

    /// Directory for the offline history cache; no cache when unset
    pub data_dir: Option<PathBuf>,

    /// Preview text for conversations without messages
    pub placeholder_text: String,

    /// Send read receipts automatically when a conversation becomes active
    pub auto_mark_read: bool,

    /// Buffer size of the notice broadcast channel
    pub notice_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            contacts: Vec::new(),
            data_dir: None,
            placeholder_text: DEFAULT_PLACEHOLDER_TEXT.to_string(),
            auto_mark_read: true,
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
        }
    }
}

impl Config {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <user_id> [contact1] [contact2] ... [--data-dir <path>] [--placeholder <text>] [--notice-capacity <n>] [--no-auto-read]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let user_id = args[1].trim().to_string();
        if user_id.is_empty() || user_id.starts_with("--") {
            return Err(SyncError::Config("user_id must be the first argument".to_string()));
        }

        let mut contacts = Vec::new();
        let mut data_dir: Option<PathBuf> = None;
        let mut placeholder_text: Option<String> = None;
        let mut notice_capacity: Option<usize> = None;
        let mut auto_mark_read = true;

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--placeholder" => {
                    let text = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--placeholder requires a text argument".to_string())
                    })?;
                    placeholder_text = Some(text.clone());
                    i += 2;
                }
                "--notice-capacity" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--notice-capacity requires a number".to_string())
                    })?;
                    notice_capacity = Some(n.parse::<usize>().map_err(|_| {
                        SyncError::Config("--notice-capacity must be a positive number".to_string())
                    })?);
                    i += 2;
                }
                "--no-auto-read" => {
                    auto_mark_read = false;
                    i += 1;
                }
                flag if flag.starts_with("--") => {
                    return Err(SyncError::Config(format!("Unknown flag: {}", flag)));
                }
                other => {
                    if other != user_id && !contacts.iter().any(|c| c == other) {
                        contacts.push(other.to_string());
                    }
                    i += 1;
                }
            }
        }

        // Env overrides
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            if !dir.is_empty() {
                data_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(text) = std::env::var("CHATSYNC_PLACEHOLDER") {
            placeholder_text = Some(text);
        }
        if std::env::var("CHATSYNC_NO_AUTO_READ").is_ok() {
            auto_mark_read = false;
        }

        if notice_capacity == Some(0) {
            return Err(SyncError::Config("--notice-capacity must be at least 1".to_string()));
        }

        Ok(Self {
            user_id,
            contacts,
            data_dir,
            placeholder_text: placeholder_text.unwrap_or_else(|| DEFAULT_PLACEHOLDER_TEXT.to_string()),
            auto_mark_read,
            notice_capacity: notice_capacity.unwrap_or(DEFAULT_NOTICE_CAPACITY),
        })
    }
}
