//! Messaging Dispatcher: typed send/edit/delete wrapping a
//! concrete `Messaging` adapter with a unified retry/backoff attempt
//! controller, text sanitization, 4096-code-unit chunking, and outbound
//! pacing.
//!
//! The per-chat serialization (`ChatLocks`) is grounded on
//! `ctb-telegram`'s router `ChatLocks` (`Mutex<HashMap<ChatId, Arc<Mutex<()>>>>`);
//! outbound pacing reuses the kept `utils::rate_limiter::RateLimiter`
//! (governor + jitter), additive beyond reactive `retry_after`
//! honoring.

pub mod telegram;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::ports::messaging::{Chat, DispatchError, Messaging};
use crate::utils::rate_limiter::RateLimiter;

const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub outbound_rate_per_minute: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            outbound_rate_per_minute: 1800,
        }
    }
}

#[derive(Default)]
struct ChatLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    async fn lock_chat(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct Dispatcher<P: Messaging> {
    inner: P,
    config: DispatcherConfig,
    pacing: RateLimiter,
    chat_locks: ChatLocks,
}

fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

fn chunk_text(text: &str) -> Vec<String> {
    let units: Vec<char> = text.chars().collect();
    if units.len() <= CHUNK_SIZE {
        return vec![text.to_string()];
    }
    warn!(len = units.len(), "splitting outgoing message into chunks");
    units
        .chunks(CHUNK_SIZE)
        .map(|c| c.iter().collect())
        .collect()
}

fn is_retryable(error: &DispatchError) -> bool {
    matches!(
        error,
        DispatchError::Transport(_) | DispatchError::Upstream { status: 429, .. }
    ) || matches!(error, DispatchError::Upstream { status, .. } if *status >= 500)
}

/// Pure delay computation over an injected jitter fraction, deterministically
/// testable (mirrors `storage::retry::backoff_delay`).
fn dispatch_backoff_delay(
    base_delay_ms: u64,
    attempt: u32,
    jitter_fraction: f64,
    retry_after: Option<Duration>,
) -> Duration {
    let computed_ms = base_delay_ms as f64 * 2f64.powi(attempt as i32) * (1.0 + 0.2 * jitter_fraction);
    let computed = Duration::from_millis(computed_ms as u64);
    match retry_after {
        Some(hint) => computed.max(hint),
        None => computed,
    }
}

fn random_dispatch_jitter_fraction() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}

fn retry_after_hint(error: &DispatchError) -> Option<Duration> {
    if let DispatchError::Upstream { description, .. } = error {
        if let Some(idx) = description.find("retry_after=") {
            let rest = &description[idx + "retry_after=".len()..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            return digits.parse::<u64>().ok().map(Duration::from_secs);
        }
    }
    None
}

impl<P: Messaging> Dispatcher<P> {
    pub fn new(inner: P, config: DispatcherConfig) -> anyhow::Result<Self> {
        Ok(Self {
            pacing: RateLimiter::new(config.outbound_rate_per_minute)?,
            inner,
            config,
            chat_locks: ChatLocks::default(),
        })
    }

    fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        dispatch_backoff_delay(
            self.config.base_delay_ms,
            attempt,
            random_dispatch_jitter_fraction(),
            retry_after,
        )
    }

    /// Runs `op` under the unified attempt controller. `swallow` selects
    /// the typing-indicator behavior of logging and returning `Ok` on
    /// exhaustion rather than surfacing the final error.
    async fn run_attempts<T, F, Fut>(
        &self,
        operation_name: &str,
        swallow: bool,
        mut op: F,
    ) -> Result<Option<T>, DispatchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, DispatchError>>,
    {
        self.pacing.acquire().await.ok();

        let mut last_error = DispatchError::Transport("no attempts made".into());
        for attempt in 0..=self.config.max_retries {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(error) => {
                    counter!("worker_dispatcher_retries_total").increment(1);
                    if !is_retryable(&error) {
                        if swallow {
                            warn!(operation_name, %error, "swallowing non-retryable dispatch error");
                            return Ok(None);
                        }
                        return Err(error);
                    }
                    let hint = retry_after_hint(&error);
                    last_error = error;
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.backoff_delay(attempt, hint)).await;
                    }
                }
            }
        }

        if swallow {
            warn!(operation_name, error = %last_error, "swallowing after exhausting retries");
            Ok(None)
        } else {
            Err(last_error)
        }
    }
}

#[async_trait::async_trait]
impl<P: Messaging> Messaging for Dispatcher<P> {
    async fn send_typing(&self, chat: &Chat) {
        let _ = self
            .run_attempts("send_typing", true, || self.inner.send_typing_result(chat))
            .await;
    }

    async fn send_text(&self, chat: &Chat, text: &str) -> Result<String, DispatchError> {
        let _guard = self.chat_locks.lock_chat(&chat.id).await;
        let sanitized = sanitize(text);
        let chunks = chunk_text(&sanitized);

        let mut first_message_id: Option<String> = None;
        for chunk in &chunks {
            let result = self
                .run_attempts("send_text", false, || self.inner.send_text(chat, chunk))
                .await?;
            if let Some(id) = result {
                if first_message_id.is_none() {
                    first_message_id = Some(id);
                }
            }
            if first_message_id.is_none() {
                break;
            }
        }

        first_message_id.ok_or_else(|| DispatchError::Transport("no chunks sent".into()))
    }

    async fn edit_message_text(
        &self,
        chat: &Chat,
        message_id: &str,
        text: &str,
    ) -> Result<(), DispatchError> {
        let _guard = self.chat_locks.lock_chat(&chat.id).await;
        let sanitized = sanitize(text);
        self.run_attempts("edit_message_text", false, || {
            self.inner.edit_message_text(chat, message_id, &sanitized)
        })
        .await?;
        Ok(())
    }

    async fn delete_message(&self, chat: &Chat, message_id: &str) -> Result<(), DispatchError> {
        let _guard = self.chat_locks.lock_chat(&chat.id).await;
        self.run_attempts("delete_message", false, || {
            self.inner.delete_message(chat, message_id)
        })
        .await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat: &Chat,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<(), DispatchError> {
        let _guard = self.chat_locks.lock_chat(&chat.id).await;
        self.run_attempts("send_document", false, || {
            self.inner.send_document(chat, filename, content.clone())
        })
        .await?;
        Ok(())
    }
}

/// Extension used internally so `send_typing`'s swallow-on-exhaustion logic
/// can reuse the same attempt controller as the surfacing operations.
#[async_trait::async_trait]
trait SendTypingResult {
    async fn send_typing_result(&self, chat: &Chat) -> Result<(), DispatchError>;
}

#[async_trait::async_trait]
impl<P: Messaging> SendTypingResult for P {
    async fn send_typing_result(&self, chat: &Chat) -> Result<(), DispatchError> {
        self.send_typing(chat).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyMessaging {
        fail_times: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Messaging for FlakyMessaging {
        async fn send_typing(&self, _chat: &Chat) {}

        async fn send_text(&self, _chat: &Chat, text: &str) -> Result<String, DispatchError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(DispatchError::Transport("flaky".into()));
            }
            Ok(format!("msg-for-{}", text.len()))
        }

        async fn edit_message_text(
            &self,
            _chat: &Chat,
            _message_id: &str,
            _text: &str,
        ) -> Result<(), DispatchError> {
            Ok(())
        }

        async fn delete_message(
            &self,
            _chat: &Chat,
            _message_id: &str,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn fast_dispatcher(fail_times: u32) -> Dispatcher<FlakyMessaging> {
        Dispatcher::new(
            FlakyMessaging {
                fail_times: AtomicU32::new(fail_times),
            },
            DispatcherConfig {
                max_retries: 3,
                base_delay_ms: 1,
                outbound_rate_per_minute: 600_000,
            },
        )
        .unwrap()
    }

    #[test]
    fn sanitize_strips_control_characters_but_keeps_newlines() {
        let input = "hello\u{0007}world\n\ttab";
        assert_eq!(sanitize(input), "helloworld\n\ttab");
    }

    #[test]
    fn chunk_text_splits_at_exactly_4096_code_units() {
        let exact = "a".repeat(4096);
        assert_eq!(chunk_text(&exact).len(), 1);

        let over = "a".repeat(4096) + "b";
        let chunks = chunk_text(&over);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4096);
        assert_eq!(chunks[1], "b");
    }

    #[test]
    fn chunk_text_handles_empty_input_as_single_chunk() {
        assert_eq!(chunk_text(""), vec!["".to_string()]);
    }

    #[test]
    fn dispatch_backoff_delay_doubles_per_attempt_with_zero_jitter() {
        assert_eq!(
            dispatch_backoff_delay(250, 0, 0.0, None),
            Duration::from_millis(250)
        );
        assert_eq!(
            dispatch_backoff_delay(250, 1, 0.0, None),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn dispatch_backoff_delay_is_floored_by_the_retry_after_hint() {
        let delay = dispatch_backoff_delay(1, 0, 0.0, Some(Duration::from_secs(5)));
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn send_text_retries_transient_failures() {
        let dispatcher = fast_dispatcher(2);
        let chat = Chat::new("123");
        let id = dispatcher.send_text(&chat, "hi").await.unwrap();
        assert_eq!(id, "msg-for-2");
    }

    #[tokio::test]
    async fn send_text_surfaces_error_after_exhausting_retries() {
        let dispatcher = fast_dispatcher(100);
        let chat = Chat::new("123");
        let result = dispatcher.send_text(&chat, "hi").await;
        assert!(result.is_err());
    }
}
