//! Storage port: user profiles and message history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRole {
    User,
    Assistant,
    System,
}

impl StoredRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoredRole::User => "user",
            StoredRole::Assistant => "assistant",
            StoredRole::System => "system",
        }
    }
}

/// `userId` is an opaque platform identifier preserved verbatim as a string.
/// Never parse it into a numeric type.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub user_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub utm_source: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub user_id: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub role: StoredRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveUserOutcome {
    pub utm_degraded: bool,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("non-retryable: {0}")]
    NonRetryable(String),
    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomic per user_id. Returns whether the utm schema-degradation
    /// fallback is currently active.
    async fn save_user(&self, profile: &UserProfile) -> Result<SaveUserOutcome, StorageError>;

    /// Idempotent under repeated calls with identical canonicalized metadata.
    async fn append_message(&self, message: &StoredMessage) -> Result<i64, StorageError>;

    /// Returns at most `limit` entries ascending by timestamp. Never
    /// propagates a failure — returns empty and logs.
    async fn get_recent_messages(&self, user_id: &str, limit: usize) -> Vec<StoredMessage>;
}
