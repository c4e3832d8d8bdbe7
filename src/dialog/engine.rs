//! Dialog Engine: the orchestration state machine joining
//! rate limiting, concurrent persistence, the AI Queue, and delivery.
//!
//! The `allSettled`-style join is
//! implemented with `tokio::join!`, which — unlike `try_join!` — always
//! drives every future to completion regardless of individual `Result`s,
//! giving the same "collect three outcomes" semantics without a hand-rolled
//! join combinator.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::ports::ai::{Ai, AiError};
use crate::ports::messaging::{DispatchError, Messaging};
use crate::ports::rate_limit::{RateLimit, RateLimitOutcome};
use crate::ports::storage::{SaveUserOutcome, Storage, StorageError, StoredMessage, StoredRole};
use crate::typing::TypingIndicator;

use super::types::{HandleOutcome, IncomingMessage, Response};

#[derive(Debug, Error)]
pub enum DialogError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("ai failure: {0}")]
    Ai(#[from] AiError),
    #[error("dispatch failure: {0}")]
    Dispatch(#[from] DispatchError),
}

pub struct DialogEngine<R, M, S, A>
where
    R: RateLimit,
    M: Messaging + 'static,
    S: Storage,
    A: Ai,
{
    rate_limit: Arc<R>,
    messaging: Arc<M>,
    storage: Arc<S>,
    ai: Arc<A>,
    typing: Arc<TypingIndicator<M>>,
    context_limit: usize,
}

impl<R, M, S, A> DialogEngine<R, M, S, A>
where
    R: RateLimit,
    M: Messaging + 'static,
    S: Storage,
    A: Ai,
{
    pub fn new(rate_limit: Arc<R>, messaging: Arc<M>, storage: Arc<S>, ai: Arc<A>) -> Self {
        let typing = Arc::new(TypingIndicator::new(messaging.clone()));
        Self {
            rate_limit,
            messaging,
            storage,
            ai,
            typing,
            context_limit: 20,
        }
    }

    pub async fn handle_message(
        &self,
        incoming: IncomingMessage,
    ) -> Result<HandleOutcome, DialogError> {
        // Step 1: rate-limit gate — zero calls to storage/ai/send on limit.
        let outcome = self
            .rate_limit
            .check_and_increment(&incoming.user.user_id, None)
            .await;
        if matches!(outcome, RateLimitOutcome::Limit) {
            return Ok(HandleOutcome::RateLimited);
        }

        // Step 2: acquire the typing indicator (sends and awaits the first
        // signal before the AI call is issued, then keeps refreshing for
        // the duration of this handler).
        let typing_guard = self.typing.acquire(&incoming.chat).await;

        let result = self.proceed(&incoming).await;

        // Invariant: the typing signal's lifecycle is always closed,
        // regardless of what `proceed` returned.
        drop(typing_guard);

        result
    }

    async fn proceed(&self, incoming: &IncomingMessage) -> Result<HandleOutcome, DialogError> {
        let now = Utc::now();
        let incoming_message = StoredMessage {
            user_id: incoming.user.user_id.clone(),
            chat_id: incoming.chat.id.clone(),
            thread_id: incoming.chat.thread_id.clone(),
            role: StoredRole::User,
            text: incoming.text.clone(),
            timestamp: now,
            metadata: incoming
                .message_id
                .as_ref()
                .map(|id| json!({"messageId": id})),
        };

        // Step 3: launch persistence concurrently.
        let save_user_fut = self.storage.save_user(&incoming.user);
        let append_message_fut = self.storage.append_message(&incoming_message);
        let recent_fut = self
            .storage
            .get_recent_messages(&incoming.user.user_id, self.context_limit);

        // Step 4: allSettled-style join — collect all three outcomes.
        let (save_result, append_result, recent_messages) =
            tokio::join!(save_user_fut, append_message_fut, recent_fut);

        let _save_outcome: SaveUserOutcome = save_result?;
        append_result?;

        // Step 5: filter context to exclude the just-recorded incoming turn.
        let context = filter_incoming(recent_messages, incoming, &incoming_message);

        // Step 6: call the AI; substitute a friendly message on overload.
        let reply = match self
            .ai
            .reply(
                &incoming.user.user_id,
                &incoming.text,
                &context,
                incoming.user.language_code.as_deref(),
            )
            .await
        {
            Ok(reply) => reply,
            Err(error) if error.is_overload() => {
                warn!(user_id = %incoming.user.user_id, %error, "AI overloaded, substituting degraded reply");
                crate::ports::ai::AiReply {
                    text: degraded_message(incoming.user.language_code.as_deref()),
                    degraded: true,
                    degraded_reason: Some(error.to_string()),
                }
            }
            Err(error) => return Err(error.into()),
        };

        // Step 7: deliver.
        let sent_message_id = match self.messaging.send_text(&incoming.chat, &reply.text).await {
            Ok(id) => Some(id),
            Err(error) => {
                error!(user_id = %incoming.user.user_id, %error, "failed to send assistant reply");
                return Err(error.into());
            }
        };

        // Step 8: persist the assistant turn with merged degradation metadata.
        let mut metadata = Value::Object(Default::default());
        if reply.degraded {
            metadata["degraded"] = json!(true);
            if let Some(reason) = &reply.degraded_reason {
                metadata["reason"] = json!(reason);
            }
        }
        if let Some(id) = &sent_message_id {
            metadata["messageId"] = json!(id);
        }

        let assistant_message = StoredMessage {
            user_id: incoming.user.user_id.clone(),
            chat_id: incoming.chat.id.clone(),
            thread_id: incoming.chat.thread_id.clone(),
            role: StoredRole::Assistant,
            text: reply.text.clone(),
            timestamp: Utc::now(),
            metadata: if metadata.as_object().map(|m| m.is_empty()).unwrap_or(true) {
                None
            } else {
                Some(metadata)
            },
        };
        self.storage.append_message(&assistant_message).await?;

        Ok(HandleOutcome::Replied(Response {
            text: reply.text,
            message_id: sent_message_id,
        }))
    }
}

fn filter_incoming(
    recent: Vec<StoredMessage>,
    incoming: &IncomingMessage,
    incoming_stored: &StoredMessage,
) -> Vec<StoredMessage> {
    recent
        .into_iter()
        .filter(|message| !is_incoming_echo(message, incoming, incoming_stored))
        .collect()
}

fn is_incoming_echo(
    candidate: &StoredMessage,
    incoming: &IncomingMessage,
    incoming_stored: &StoredMessage,
) -> bool {
    if let Some(message_id) = &incoming.message_id {
        if let Some(candidate_id) = candidate
            .metadata
            .as_ref()
            .and_then(|m| m.get("messageId"))
            .and_then(|v| v.as_str())
        {
            return candidate_id == message_id;
        }
    }

    candidate.role == StoredRole::User
        && candidate.text == incoming_stored.text
        && candidate.timestamp == incoming_stored.timestamp
}

fn degraded_message(language_code: Option<&str>) -> String {
    match language_code {
        Some(code) if code.starts_with("es") => {
            "Estoy recibiendo muchas solicitudes ahora mismo. Intenta de nuevo en un momento."
                .to_string()
        }
        _ => "I'm getting a lot of requests right now. Please try again in a moment.".to_string(),
    }
}
