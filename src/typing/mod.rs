//! Typing Indicator: ref-counted per-`(chatId, threadId)`
//! typing signal with a background refresh loop, keyed the same way the
//! reference backend's `ChatLocks` keys per-chat mutexes in `messaging::Dispatcher`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ports::messaging::{Chat, Messaging};

const DEFAULT_REFRESH_INTERVAL_MS: u64 = 4_000;

#[derive(Eq, PartialEq, Hash, Clone)]
struct Key {
    chat_id: String,
    thread_id: Option<String>,
}

struct Entry {
    count: usize,
    cancel: CancellationToken,
}

pub struct TypingIndicator<P: Messaging> {
    messaging: Arc<P>,
    refresh_interval: Duration,
    entries: Mutex<HashMap<Key, Entry>>,
}

/// Held by a caller while a response is being composed; dropping it
/// releases the ref-count and, at zero, cancels the refresh loop.
pub struct TypingGuard<P: Messaging> {
    indicator: Arc<TypingIndicator<P>>,
    key: Key,
}

impl<P: Messaging> Drop for TypingGuard<P> {
    fn drop(&mut self) {
        self.indicator.release(&self.key);
    }
}

impl<P: Messaging + 'static> TypingIndicator<P> {
    pub fn new(messaging: Arc<P>) -> Self {
        Self::with_refresh_interval(messaging, Duration::from_millis(DEFAULT_REFRESH_INTERVAL_MS))
    }

    pub fn with_refresh_interval(messaging: Arc<P>, refresh_interval: Duration) -> Self {
        Self {
            messaging,
            refresh_interval,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Sends the first typing signal (awaited, so the caller's subsequent
    /// AI call never races ahead of it reaching the wire) before spawning
    /// the periodic refresh loop, on the first acquisition for this chat.
    pub async fn acquire(self: &Arc<Self>, chat: &Chat) -> TypingGuard<P> {
        let key = Key {
            chat_id: chat.id.clone(),
            thread_id: chat.thread_id.clone(),
        };

        let should_start = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.count += 1;
                    false
                }
                None => {
                    entries.insert(
                        key.clone(),
                        Entry {
                            count: 1,
                            cancel: CancellationToken::new(),
                        },
                    );
                    true
                }
            }
        };

        if should_start {
            self.messaging.send_typing(chat).await;
            self.spawn_refresh_loop(chat.clone(), key.clone());
        }

        TypingGuard {
            indicator: self.clone(),
            key,
        }
    }

    fn spawn_refresh_loop(self: &Arc<Self>, chat: Chat, key: Key) {
        let this = self.clone();
        let cancel = {
            let entries = self.entries.lock();
            entries
                .get(&key)
                .map(|e| e.cancel.clone())
                .unwrap_or_default()
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.refresh_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(chat_id = %chat.id, "typing refresh loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        this.messaging.send_typing(&chat).await;
                        counter!("worker_typing_refresh_total").increment(1);
                    }
                }
            }
        });
    }

    fn release(&self, key: &Key) {
        let cancel = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.count -= 1;
                    if entry.count == 0 {
                        entries.remove(key).map(|e| e.cancel)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::messaging::DispatchError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMessaging {
        sends: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Messaging for CountingMessaging {
        async fn send_typing(&self, _chat: &Chat) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }

        async fn send_text(&self, _chat: &Chat, _text: &str) -> Result<String, DispatchError> {
            unimplemented!()
        }

        async fn edit_message_text(
            &self,
            _chat: &Chat,
            _message_id: &str,
            _text: &str,
        ) -> Result<(), DispatchError> {
            unimplemented!()
        }

        async fn delete_message(&self, _chat: &Chat, _message_id: &str) -> Result<(), DispatchError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn first_acquire_sends_immediately() {
        let sends = Arc::new(AtomicUsize::new(0));
        let messaging = Arc::new(CountingMessaging {
            sends: sends.clone(),
        });
        let indicator = Arc::new(TypingIndicator::with_refresh_interval(
            messaging,
            Duration::from_secs(60),
        ));
        let chat = Chat::new("1");
        let _guard = indicator.acquire(&chat).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_acquisitions_only_increment_refcount() {
        let sends = Arc::new(AtomicUsize::new(0));
        let messaging = Arc::new(CountingMessaging {
            sends: sends.clone(),
        });
        let indicator = Arc::new(TypingIndicator::with_refresh_interval(
            messaging,
            Duration::from_secs(60),
        ));
        let chat = Chat::new("1");
        let guard1 = indicator.acquire(&chat).await;
        let guard2 = indicator.acquire(&chat).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(indicator.entries.lock().get(&Key {
            chat_id: "1".into(),
            thread_id: None,
        }).unwrap().count, 2);
        drop(guard1);
        drop(guard2);
    }

    #[tokio::test]
    async fn release_to_zero_cancels_refresh_loop() {
        let sends = Arc::new(AtomicUsize::new(0));
        let messaging = Arc::new(CountingMessaging {
            sends: sends.clone(),
        });
        let indicator = Arc::new(TypingIndicator::with_refresh_interval(
            messaging,
            Duration::from_millis(10),
        ));
        let chat = Chat::new("1");
        let guard = indicator.acquire(&chat).await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        drop(guard);
        let count_at_release = sends.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sends.load(Ordering::SeqCst), count_at_release);
        assert!(indicator.entries.lock().is_empty());
    }
}
