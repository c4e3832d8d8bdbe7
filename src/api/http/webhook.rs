// src/api/http/webhook.rs
// POST /webhook/<secret> — the router joining the Webhook Decoder to
// either the Dialog Engine or the Admin Command Gate.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::admin::CommandOutcome;
use crate::api::error::{ApiError, ApiResult};
use crate::dialog::{HandleOutcome, IncomingMessage};
use crate::state::AppState;
use crate::webhook::{decode, MessageRoute, WebhookOutcome};

pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Path(secret): Path<String>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    if secret != state.config.server.webhook_secret {
        return Err(ApiError::forbidden("invalid webhook secret"));
    }

    match decode(&body)? {
        WebhookOutcome::Handled(_) => Ok(Json(json!({"status": "ignored"}))),
        WebhookOutcome::NonText { chat, kind } => {
            if let Err(error) = state.messaging.send_text(&chat, kind.reply_text()).await {
                warn!(%error, "failed to send non-text auto-reply");
            }
            Ok(Json(json!({"status": "ok"})))
        }
        WebhookOutcome::Message { incoming, route } => match route {
            MessageRoute::Default => handle_default(&state, incoming).await,
            MessageRoute::Command(command) => handle_command(&state, incoming, &command).await,
        },
    }
}

async fn handle_default(
    state: &Arc<AppState>,
    incoming: IncomingMessage,
) -> ApiResult<Json<serde_json::Value>> {
    let chat = incoming.chat.clone();
    let user_id = incoming.user.user_id.clone();

    match state.dialog.handle_message(incoming).await? {
        HandleOutcome::RateLimited => {
            if !state.notifier.notify(&user_id, &chat).await {
                if let Err(error) = state
                    .messaging
                    .send_text(&chat, state.notifier.fallback_text())
                    .await
                {
                    warn!(%error, "failed to send rate-limit fallback text");
                }
            }
            Ok(Json(json!({"status": "rate_limited"})))
        }
        HandleOutcome::Replied(response) => Ok(Json(json!({
            "status": "ok",
            "messageId": response.message_id,
        }))),
    }
}

async fn handle_command(
    state: &Arc<AppState>,
    incoming: IncomingMessage,
    command: &str,
) -> ApiResult<Json<serde_json::Value>> {
    let args: Vec<&str> = incoming.text.split_whitespace().skip(1).collect();
    let outcome = state
        .admin_gate
        .handle(
            &incoming.user.user_id,
            &incoming.chat,
            command,
            &args,
            incoming.update_id.as_deref(),
        )
        .await;

    match outcome {
        CommandOutcome::Silent => Ok(Json(json!({"status": "ignored"}))),
        CommandOutcome::Reply(text) => {
            let message_id = state.messaging.send_text(&incoming.chat, &text).await?;
            Ok(Json(json!({"status": "ok", "messageId": message_id})))
        }
    }
}
