//! Concrete `Messaging` adapter over the Telegram Bot HTTP API, used by
//! Composition as the default outbound adapter. Errors from this layer are
//! always raw (non-retried) — retry/backoff lives one level up in
//! `Dispatcher`.

use async_trait::async_trait;
use serde_json::json;

use crate::ports::messaging::{Chat, DispatchError, Messaging};

pub struct TelegramMessaging {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramMessaging {
    pub fn new(bot_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
        }
    }

    fn chat_id(chat: &Chat) -> Result<i64, DispatchError> {
        chat.id
            .parse::<i64>()
            .map_err(|_| DispatchError::InvalidId(chat.id.clone()))
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value, DispatchError> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let payload: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({"ok": false, "description": "non-json response"}));

        if status.is_success() && payload.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Ok(payload);
        }

        let description = payload
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown upstream error")
            .to_string();
        let description = match retry_after {
            Some(ra) => format!("{description} (retry_after={ra})"),
            None => description,
        };

        Err(DispatchError::Upstream {
            status: status.as_u16(),
            description,
        })
    }
}

#[async_trait]
impl Messaging for TelegramMessaging {
    async fn send_typing(&self, chat: &Chat) {
        let Ok(chat_id) = Self::chat_id(chat) else {
            return;
        };
        let mut payload = json!({"chat_id": chat_id, "action": "typing"});
        if let Some(thread_id) = &chat.thread_id {
            payload["message_thread_id"] = json!(thread_id.parse::<i64>().unwrap_or_default());
        }
        let _ = self.call("sendChatAction", payload).await;
    }

    async fn send_text(&self, chat: &Chat, text: &str) -> Result<String, DispatchError> {
        let chat_id = Self::chat_id(chat)?;
        let mut payload = json!({"chat_id": chat_id, "text": text});
        if let Some(thread_id) = &chat.thread_id {
            payload["message_thread_id"] = json!(thread_id.parse::<i64>().unwrap_or_default());
        }
        let response = self.call("sendMessage", payload).await?;
        let message_id = response
            .get("result")
            .and_then(|r| r.get("message_id"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DispatchError::Transport("missing message_id in response".into()))?;
        Ok(message_id.to_string())
    }

    async fn edit_message_text(
        &self,
        chat: &Chat,
        message_id: &str,
        text: &str,
    ) -> Result<(), DispatchError> {
        let chat_id = Self::chat_id(chat)?;
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| DispatchError::InvalidId(message_id.to_string()))?;
        let payload = json!({"chat_id": chat_id, "message_id": message_id, "text": text});
        self.call("editMessageText", payload).await?;
        Ok(())
    }

    async fn delete_message(&self, chat: &Chat, message_id: &str) -> Result<(), DispatchError> {
        let chat_id = Self::chat_id(chat)?;
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| DispatchError::InvalidId(message_id.to_string()))?;
        let payload = json!({"chat_id": chat_id, "message_id": message_id});
        self.call("deleteMessage", payload).await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat: &Chat,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<(), DispatchError> {
        let chat_id = Self::chat_id(chat)?;
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str("text/csv")
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);

        let url = format!("{}/sendDocument", self.base_url);
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let description = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        Err(DispatchError::Upstream {
            status: status.as_u16(),
            description,
        })
    }
}
