//! AI Queue: bounded-concurrency gate, FIFO wait queue,
//! per-request timeout, jittered retry with endpoint failover.
//!
//! Grounded on the reference backend's `llm::router::ModelRouter::route_with_fallback`
//! for the endpoint-failover idea and `utils::timeout::with_timeout` for deadline
//! wrapping; the admit/release bookkeeping has no direct counterpart elsewhere and is
//! built fresh with `tokio::sync::Semaphore` (FIFO-fair by construction) plus
//! `parking_lot::Mutex`-guarded counters, matching the reference backend's preference
//! for `parking_lot` over `std::sync::Mutex` in `utils::rate_limiter`.

pub mod config;

pub use config::AiQueueConfig;

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::ports::ai::{Ai, AiError, AiReply, QueueStats, QueueStatsSnapshot};
use crate::ports::storage::StoredMessage;

struct EndpointPool {
    urls: Vec<String>,
    current: AtomicUsize,
    consecutive_failures: AtomicU32,
    failover_threshold: u32,
}

impl EndpointPool {
    fn new(urls: Vec<String>, failover_threshold: u32) -> Self {
        Self {
            urls,
            current: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            failover_threshold,
        }
    }

    fn current_url(&self) -> &str {
        let idx = self.current.load(Ordering::SeqCst) % self.urls.len();
        &self.urls[idx]
    }

    fn record_failure(&self) {
        let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.failover_threshold && self.urls.len() > 1 {
            let next = (self.current.fetch_add(1, Ordering::SeqCst) + 1) % self.urls.len();
            self.consecutive_failures.store(0, Ordering::SeqCst);
            warn!(endpoint = %self.urls[next], "failing over to next AI endpoint");
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }
}

struct WaitStats {
    recent_wait_ms: Mutex<std::collections::VecDeque<u64>>,
    dropped_since_boot: AtomicU64,
    last_drop_at: Mutex<Option<i64>>,
}

impl WaitStats {
    fn new() -> Self {
        Self {
            recent_wait_ms: Mutex::new(std::collections::VecDeque::with_capacity(64)),
            dropped_since_boot: AtomicU64::new(0),
            last_drop_at: Mutex::new(None),
        }
    }

    fn record_wait(&self, ms: u64) {
        let mut recent = self.recent_wait_ms.lock();
        if recent.len() == 64 {
            recent.pop_front();
        }
        recent.push_back(ms);
    }

    fn avg_wait_ms(&self) -> f64 {
        let recent = self.recent_wait_ms.lock();
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().sum::<u64>() as f64 / recent.len() as f64
    }

    fn record_drop(&self) {
        self.dropped_since_boot.fetch_add(1, Ordering::SeqCst);
        *self.last_drop_at.lock() = Some(chrono::Utc::now().timestamp());
    }
}

pub struct AiQueue {
    config: AiQueueConfig,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
    endpoints: EndpointPool,
    stats: WaitStats,
    http: reqwest::Client,
}

impl AiQueue {
    pub fn new(config: AiQueueConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let endpoints = EndpointPool::new(
            config.base_urls.clone(),
            config.endpoint_failover_threshold,
        );
        Self {
            semaphore,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            endpoints,
            stats: WaitStats::new(),
            http: reqwest::Client::new(),
            config,
        }
    }

    fn publish_gauges(&self) {
        gauge!("worker_ai_queue_active").set(self.active.load(Ordering::SeqCst) as f64);
        gauge!("worker_ai_queue_queued").set(self.queued.load(Ordering::SeqCst) as f64);
    }

    /// Admits a permit respecting `maxConcurrency`/`maxQueueSize`, honoring
    /// `deadline` as the caller's wait budget (acquisition
    /// protocol).
    async fn admit(&self, deadline: Duration) -> Result<AdmitGuard<'_>, AiError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            self.active.fetch_add(1, Ordering::SeqCst);
            self.publish_gauges();
            return Ok(AdmitGuard {
                _permit: permit,
                active: &self.active,
            });
        }

        if self.queued.load(Ordering::SeqCst) >= self.config.max_queue_size {
            self.stats.record_drop();
            counter!("worker_ai_queue_dropped_total").increment(1);
            return Err(AiError::QueueFull);
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        self.publish_gauges();
        let wait_start = Instant::now();
        let acquired = tokio::time::timeout(deadline, self.semaphore.clone().acquire_owned()).await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        match acquired {
            Ok(Ok(permit)) => {
                let waited_ms = wait_start.elapsed().as_millis() as u64;
                self.stats.record_wait(waited_ms);
                histogram!("worker_ai_queue_wait_ms").record(waited_ms as f64);
                self.active.fetch_add(1, Ordering::SeqCst);
                self.publish_gauges();
                Ok(AdmitGuard {
                    _permit: permit,
                    active: &self.active,
                })
            }
            Ok(Err(_closed)) => Err(AiError::Transport("queue closed".into())),
            Err(_elapsed) => Err(AiError::QueueTimeout),
        }
    }

    fn build_payload(&self, user_id: &str, text: &str, context: &[StoredMessage]) -> Value {
        let mut input: Vec<Value> = context
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": [{"type": "text", "text": m.text}],
                })
            })
            .collect();
        input.push(json!({
            "role": "user",
            "content": [{"type": "text", "text": text}],
        }));

        json!({
            "assistant_id": self.config.assistant_id,
            "model": self.config.model,
            "metadata": {"userId": user_id},
            "input": input,
        })
    }

    async fn attempt_once(&self, payload: &Value) -> Result<String, AiError> {
        let url = self.endpoints.current_url().to_string();
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            self.endpoints.record_success();
            let body: Value = response
                .json()
                .await
                .map_err(|e| AiError::Transport(e.to_string()))?;
            return Ok(extract_text(&body));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let description = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());

        if status.as_u16() == 429 || status.is_server_error() {
            self.endpoints.record_failure();
            Err(AiError::NonTwoXx {
                status: status.as_u16(),
                description: format!("retryable: {description} (retry_after={retry_after:?})"),
                request_id,
            })
        } else {
            Err(AiError::NonTwoXx {
                status: status.as_u16(),
                description,
                request_id,
            })
        }
    }

}

/// Exponential retry delay with multiplicative jitter, pure over an
/// injected fraction so retry timing is deterministically testable
/// (mirrors `storage::retry::backoff_delay`).
fn retry_backoff_delay(attempt: u32, jitter_fraction: f64) -> Duration {
    let delay_ms = 100.0 * 2f64.powi(attempt as i32) * (1.0 + jitter_fraction);
    Duration::from_millis(delay_ms as u64)
}

fn random_retry_jitter_fraction() -> f64 {
    rand::thread_rng().gen_range(0.0..0.3)
}

fn retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn extract_text(body: &Value) -> String {
    if let Some(text) = body.get("output_text") {
        if let Some(s) = text.as_str() {
            return s.to_string();
        }
        if let Some(arr) = text.as_array() {
            return arr
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join("");
        }
    }

    if let Some(output) = body.get("output").and_then(|v| v.as_array()) {
        let mut out = String::new();
        for item in output {
            if let Some(content) = item.get("content").and_then(|v| v.as_array()) {
                for c in content {
                    if let Some(t) = c.get("text") {
                        if let Some(s) = t.as_str() {
                            out.push_str(s);
                        } else if let Some(v) = t.get("value").and_then(|v| v.as_str()) {
                            out.push_str(v);
                        }
                    }
                }
            }
        }
        if !out.is_empty() {
            return out;
        }
    }

    String::new()
}

struct AdmitGuard<'a> {
    _permit: tokio::sync::OwnedSemaphorePermit,
    active: &'a AtomicUsize,
}

impl Drop for AdmitGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Ai for AiQueue {
    async fn reply(
        &self,
        user_id: &str,
        text: &str,
        context: &[StoredMessage],
        _language_code: Option<&str>,
    ) -> Result<AiReply, AiError> {
        let overall_deadline = Duration::from_millis(self.config.request_timeout_ms);
        let start = Instant::now();

        let _permit = self.admit(overall_deadline).await?;

        let remaining = overall_deadline.saturating_sub(start.elapsed());
        let payload = self.build_payload(user_id, text, context);

        let attempt_loop = async {
            let mut last_error = AiError::Transport("no attempts made".into());
            for attempt in 0..=self.config.retry_max {
                match self.attempt_once(&payload).await {
                    Ok(text) => {
                        if text.trim().is_empty() {
                            last_error = AiError::NonTwoXx {
                                status: 502,
                                description: "empty response body".into(),
                                request_id: None,
                            };
                            continue;
                        }
                        return Ok(text);
                    }
                    Err(error @ AiError::NonTwoXx { status, .. })
                        if !retryable_status(status) =>
                    {
                        return Err(error);
                    }
                    Err(error) => {
                        last_error = error;
                        if attempt < self.config.retry_max {
                            let delay = retry_backoff_delay(attempt, random_retry_jitter_fraction());
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            Err(last_error)
        };

        match tokio::time::timeout(remaining, attempt_loop).await {
            Ok(Ok(text)) => Ok(AiReply {
                text,
                degraded: false,
                degraded_reason: None,
            }),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                debug!(user_id, "AI reply timed out after admission");
                Err(AiError::TimedOut)
            }
        }
    }
}

impl QueueStats for AiQueue {
    fn queue_stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            max_concurrency: self.config.max_concurrency,
            max_queue: self.config.max_queue_size,
            dropped_since_boot: self.stats.dropped_since_boot.load(Ordering::SeqCst),
            avg_wait_ms: self.stats.avg_wait_ms(),
            last_drop_at: *self.stats.last_drop_at.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AiQueueConfig {
        AiQueueConfig {
            max_concurrency: 2,
            max_queue_size: 1,
            request_timeout_ms: 5_000,
            retry_max: 1,
            endpoint_failover_threshold: 2,
            base_urls: vec!["http://127.0.0.1:1/unreachable".into()],
            assistant_id: "asst_test".into(),
            model: "gpt-5".into(),
        }
    }

    #[tokio::test]
    async fn admits_up_to_max_concurrency_without_waiting() {
        let queue = AiQueue::new(test_config());
        let g1 = queue.admit(Duration::from_millis(50)).await.unwrap();
        let g2 = queue.admit(Duration::from_millis(50)).await.unwrap();
        assert_eq!(queue.active.load(Ordering::SeqCst), 2);
        drop(g1);
        drop(g2);
        assert_eq!(queue.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_with_queue_full_once_wait_list_is_saturated() {
        let queue = AiQueue::new(test_config());
        let g1 = queue.admit(Duration::from_millis(50)).await.unwrap();
        let g2 = queue.admit(Duration::from_millis(50)).await.unwrap();

        // max_concurrency=2 is exhausted; max_queue_size=1 allows one
        // waiter, a second concurrent admit attempt must be dropped.
        let waiter = queue.admit(Duration::from_millis(200));
        let second = queue.admit(Duration::from_millis(0));
        let (waiter_result, second_result) = tokio::join!(waiter, second);

        assert!(matches!(second_result, Err(AiError::QueueFull)));
        drop(waiter_result);
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn admit_times_out_when_no_permit_becomes_available() {
        let queue = AiQueue::new(test_config());
        let _g1 = queue.admit(Duration::from_millis(50)).await.unwrap();
        let _g2 = queue.admit(Duration::from_millis(50)).await.unwrap();

        let result = queue.admit(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(AiError::QueueTimeout)));
    }

    #[test]
    fn retry_backoff_delay_doubles_per_attempt_with_zero_jitter() {
        assert_eq!(retry_backoff_delay(0, 0.0), Duration::from_millis(100));
        assert_eq!(retry_backoff_delay(1, 0.0), Duration::from_millis(200));
        assert_eq!(retry_backoff_delay(2, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn extract_text_reads_output_text_string() {
        let body = json!({"output_text": "hello"});
        assert_eq!(extract_text(&body), "hello");
    }

    #[test]
    fn extract_text_reads_output_content_tree() {
        let body = json!({
            "output": [{"content": [{"text": {"value": "nested"}}]}]
        });
        assert_eq!(extract_text(&body), "nested");
    }

    #[test]
    fn retryable_status_covers_429_and_5xx() {
        assert!(retryable_status(429));
        assert!(retryable_status(503));
        assert!(!retryable_status(404));
    }
}
