//! AI port: request a reply through the bounded-concurrency queue.

use async_trait::async_trait;
use thiserror::Error;

use super::storage::StoredMessage;

/// A reply from the assistant plus any degradation metadata the Dialog
/// Engine should thread onto the persisted assistant turn.
#[derive(Debug, Clone)]
pub struct AiReply {
    pub text: String,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI_QUEUE_FULL")]
    QueueFull,
    #[error("AI_QUEUE_TIMEOUT")]
    QueueTimeout,
    #[error("AI_NON_2XX: {status} {description}")]
    NonTwoXx {
        status: u16,
        description: String,
        request_id: Option<String>,
    },
    #[error("timed out")]
    TimedOut,
    #[error("transport error: {0}")]
    Transport(String),
}

impl AiError {
    /// Whether the Dialog Engine should substitute a friendly overload
    /// message instead of rethrowing.
    pub fn is_overload(&self) -> bool {
        matches!(self, AiError::QueueTimeout | AiError::QueueFull)
    }
}

#[async_trait]
pub trait Ai: Send + Sync {
    /// Overall deadline <=20s including retries. Returned text is non-empty
    /// and sanitized.
    async fn reply(
        &self,
        user_id: &str,
        text: &str,
        context: &[StoredMessage],
        language_code: Option<&str>,
    ) -> Result<AiReply, AiError>;
}

/// Optional diagnostics capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStatsSnapshot {
    pub active: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub max_queue: usize,
    pub dropped_since_boot: u64,
    pub avg_wait_ms: f64,
    pub last_drop_at: Option<i64>,
}

pub trait QueueStats: Send + Sync {
    fn queue_stats(&self) -> QueueStatsSnapshot;
}
