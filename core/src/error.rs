/// Error types for the conversation sync engine
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rejected by server: {0}")]
    Validation(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session error: {0}")]
    Session(String),

    /// A mutation targeted a temp message whose own send never confirmed
    #[error("Message was never confirmed: {0}")]
    Unconfirmed(String),
}

impl SyncError {
    /// Only transport failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<sled::Error> for SyncError {
    fn from(e: sled::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(format!("IO: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
