//! Messaging port: typed send/edit/delete with platform-agnostic chat coordinates.

use async_trait::async_trait;
use thiserror::Error;

/// Chat coordinates as received from the webhook. IDs are always strings —
/// see the big-int-safety invariant in `crate::webhook`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chat {
    pub id: String,
    pub thread_id: Option<String>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: None,
        }
    }

    pub fn with_thread(id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: Some(thread_id.into()),
        }
    }
}

/// Failure taxonomy for the Messaging port. `sendTyping` never surfaces this —
/// it always swallows and logs (see `crate::messaging::Dispatcher::send_typing`).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("upstream {status}: {description}")]
    Upstream { status: u16, description: String },
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Messaging: Send + Sync {
    /// Best-effort; must never return an error to the caller.
    async fn send_typing(&self, chat: &Chat);

    /// Retries with backoff, honors `retry_after`; returns the id of the
    /// first chunk sent. Splits `text` into 4096-code-unit chunks.
    async fn send_text(&self, chat: &Chat, text: &str) -> Result<String, DispatchError>;

    async fn edit_message_text(
        &self,
        chat: &Chat,
        message_id: &str,
        text: &str,
    ) -> Result<(), DispatchError>;

    async fn delete_message(&self, chat: &Chat, message_id: &str) -> Result<(), DispatchError>;

    /// Uploads `content` as a named document. Default implementation
    /// rejects — most adapters used in tests don't need it; the concrete
    /// platform adapter overrides it for the Admin Command Gate's export
    /// upload.
    async fn send_document(
        &self,
        _chat: &Chat,
        _filename: &str,
        _content: Vec<u8>,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::Transport(
            "send_document not supported by this adapter".into(),
        ))
    }
}
