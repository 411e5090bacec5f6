/// Error types for the chat sync engine
use thiserror::Error;

/// Failure reported by an external collaborator (REST backend, push service)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Push channel error: {0}")]
    Channel(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Network(msg) => SyncError::Network(msg),
            BackendError::Forbidden(msg) => SyncError::PermissionDenied(msg),
            BackendError::NotFound(msg) => SyncError::NotFound(msg),
            BackendError::Rejected(msg) => SyncError::Rejected(msg),
        }
    }
}

impl SyncError {
    /// Permission failures are surfaced separately from transient ones
    pub fn is_permission(&self) -> bool {
        matches!(self, SyncError::PermissionDenied(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
