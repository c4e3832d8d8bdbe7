//! No-op port implementations (fallbacks for all four
//! ports"). Used for local/dev wiring and tests where a concrete adapter
//! isn't configured; production `Composition` always wires concrete
//! adapters (see `crate::state::AppState::new`) since required secrets are
//! loaded with `config::helpers::require_env`'s fail-fast discipline.

use async_trait::async_trait;

use super::ai::{Ai, AiError, AiReply};
use super::messaging::{Chat, DispatchError, Messaging};
use super::rate_limit::{RateLimit, RateLimitOutcome};
use super::storage::{SaveUserOutcome, Storage, StorageError, StoredMessage, UserProfile};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMessaging;

#[async_trait]
impl Messaging for NoopMessaging {
    async fn send_typing(&self, _chat: &Chat) {}

    async fn send_text(&self, _chat: &Chat, _text: &str) -> Result<String, DispatchError> {
        Err(DispatchError::Transport("no messaging adapter configured".into()))
    }

    async fn edit_message_text(
        &self,
        _chat: &Chat,
        _message_id: &str,
        _text: &str,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::Transport("no messaging adapter configured".into()))
    }

    async fn delete_message(&self, _chat: &Chat, _message_id: &str) -> Result<(), DispatchError> {
        Err(DispatchError::Transport("no messaging adapter configured".into()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

#[async_trait]
impl Storage for NoopStorage {
    async fn save_user(&self, _profile: &UserProfile) -> Result<SaveUserOutcome, StorageError> {
        Ok(SaveUserOutcome::default())
    }

    async fn append_message(&self, _message: &StoredMessage) -> Result<i64, StorageError> {
        Ok(0)
    }

    async fn get_recent_messages(&self, _user_id: &str, _limit: usize) -> Vec<StoredMessage> {
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAi;

#[async_trait]
impl Ai for NoopAi {
    async fn reply(
        &self,
        _user_id: &str,
        _text: &str,
        _context: &[StoredMessage],
        _language_code: Option<&str>,
    ) -> Result<AiReply, AiError> {
        Err(AiError::Transport("no AI adapter configured".into()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRateLimit;

#[async_trait]
impl RateLimit for NoopRateLimit {
    async fn check_and_increment(&self, _user_id: &str, _context: Option<&str>) -> RateLimitOutcome {
        RateLimitOutcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_rate_limit_always_allows() {
        assert_eq!(
            NoopRateLimit.check_and_increment("u1", None).await,
            RateLimitOutcome::Ok
        );
    }

    #[tokio::test]
    async fn noop_storage_reports_no_history() {
        assert!(NoopStorage.get_recent_messages("u1", 10).await.is_empty());
    }
}
