use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::ports::messaging::{Chat, Messaging};
use crate::storage::KvStore;

const COOLDOWN_KEY_PREFIX: &str = "notify-cooldown:";
const COOLDOWN_TTL_SECONDS: i64 = 60;
const FALLBACK_TEXT: &str = "You're sending messages a bit too fast. Please try again shortly.";

#[derive(Debug, Serialize, Deserialize)]
struct CooldownEntry {
    expires_at: i64,
    notice_sent_at: Option<i64>,
}

/// Sends exactly one user-visible cooldown notice per window.
/// `window_ms` is used only to format the TTL, not to decide whether a
/// notice is due — that's governed by the persisted cooldown entry.
pub struct Notifier<P: Messaging> {
    messaging: Arc<P>,
    kv: Arc<KvStore>,
    window_ms: i64,
}

impl<P: Messaging> Notifier<P> {
    pub fn new(messaging: Arc<P>, kv: Arc<KvStore>, window_ms: i64) -> Self {
        Self {
            messaging,
            kv,
            window_ms,
        }
    }

    /// Returns `true` if a notice was sent (or already pending-sent this
    /// window), `false` if the webhook layer must fall back to static text.
    pub async fn notify(&self, user_id: &str, chat: &Chat) -> bool {
        let key = format!("{COOLDOWN_KEY_PREFIX}{user_id}");
        let now = Utc::now().timestamp();

        let mut entry = match self.kv.get(&key).await {
            Some(raw) => serde_json::from_str::<CooldownEntry>(&raw).unwrap_or(CooldownEntry {
                expires_at: now + COOLDOWN_TTL_SECONDS,
                notice_sent_at: None,
            }),
            None => CooldownEntry {
                expires_at: now + COOLDOWN_TTL_SECONDS,
                notice_sent_at: None,
            },
        };

        if entry.notice_sent_at.is_some() {
            return true;
        }

        let now_ms = Utc::now().timestamp_millis();
        let remaining_ms = self.window_ms - (now_ms % self.window_ms);
        let text = format!(
            "You're doing that too much. Try again in {}.",
            format_ttl(remaining_ms)
        );

        let send_result = self.messaging.send_text(chat, &text).await;
        match send_result {
            Ok(_) => {
                entry.notice_sent_at = Some(now);
                if let Err(error) = self
                    .kv
                    .set(&key, &json!(entry).to_string(), Some(COOLDOWN_TTL_SECONDS))
                    .await
                {
                    warn!(%error, user_id, "failed to persist cooldown notice marker");
                }
                true
            }
            Err(error) => {
                warn!(%error, user_id, "cooldown notifier send failed, falling back to static text");
                false
            }
        }
    }

    pub fn fallback_text(&self) -> &'static str {
        FALLBACK_TEXT
    }
}

fn format_ttl(remaining_ms: i64) -> String {
    let total_seconds = (remaining_ms / 1000).max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_ttl_floors_to_hours_minutes_seconds() {
        assert_eq!(format_ttl(59_000), "59s");
        assert_eq!(format_ttl(125_000), "2m 5s");
        assert_eq!(format_ttl(3_661_000), "1h 1m");
    }
}
