use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::ports::rate_limit::{RateLimit, RateLimitOutcome};
use crate::storage::KvStore;

const LIMITS_ENABLED_KEY: &str = "LIMITS_ENABLED";
const DISABLED_VALUES: &[&str] = &["0", "false", "off", "no", "disabled"];

struct CachedFlag {
    enabled: bool,
    checked_at: Instant,
}

/// Wraps a raw `RateLimit` port behind the `LIMITS_ENABLED` KV flag.
/// A missing key defaults to enabled; a KV read failure disables the gate
/// (logged) so an outage degrades to unblocked traffic, not a stuck 429.
pub struct RateLimitToggle<R: RateLimit> {
    inner: Arc<R>,
    kv: Arc<KvStore>,
    refresh_interval: Duration,
    cache: Mutex<Option<CachedFlag>>,
}

impl<R: RateLimit> RateLimitToggle<R> {
    pub fn new(inner: Arc<R>, kv: Arc<KvStore>, refresh_interval: Duration) -> Self {
        Self {
            inner,
            kv,
            refresh_interval,
            cache: Mutex::new(None),
        }
    }

    async fn is_enabled(&self) -> bool {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.checked_at.elapsed() < self.refresh_interval {
                return cached.enabled;
            }
        }

        let enabled = match self.kv.try_get(LIMITS_ENABLED_KEY).await {
            Ok(Some(raw)) => !DISABLED_VALUES.contains(&raw.to_lowercase().as_str()),
            Ok(None) => true,
            Err(error) => {
                warn!(%error, "LIMITS_ENABLED read failed, disabling rate limit gate");
                false
            }
        };

        *cache = Some(CachedFlag {
            enabled,
            checked_at: Instant::now(),
        });
        enabled
    }
}

#[async_trait]
impl<R: RateLimit> RateLimit for RateLimitToggle<R> {
    async fn check_and_increment(&self, user_id: &str, context: Option<&str>) -> RateLimitOutcome {
        if !self.is_enabled().await {
            return RateLimitOutcome::Ok;
        }
        self.inner.check_and_increment(user_id, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRateLimit {
        calls: AtomicUsize,
        outcome: RateLimitOutcome,
    }

    #[async_trait]
    impl RateLimit for CountingRateLimit {
        async fn check_and_increment(&self, _user_id: &str, _context: Option<&str>) -> RateLimitOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    async fn kv_store() -> Arc<KvStore> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let kv = KvStore::new(pool);
        kv.ensure_schema().await.unwrap();
        Arc::new(kv)
    }

    #[tokio::test]
    async fn missing_flag_defaults_to_enabled() {
        let kv = kv_store().await;
        let inner = Arc::new(CountingRateLimit {
            calls: AtomicUsize::new(0),
            outcome: RateLimitOutcome::Ok,
        });
        let toggle = RateLimitToggle::new(inner.clone(), kv, Duration::from_secs(60));
        toggle.check_and_increment("u1", None).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_value_bypasses_the_inner_limiter() {
        let kv = kv_store().await;
        kv.set(LIMITS_ENABLED_KEY, "off", None).await.unwrap();
        let inner = Arc::new(CountingRateLimit {
            calls: AtomicUsize::new(0),
            outcome: RateLimitOutcome::Limit,
        });
        let toggle = RateLimitToggle::new(inner.clone(), kv, Duration::from_secs(60));
        let outcome = toggle.check_and_increment("u1", None).await;
        assert!(matches!(outcome, RateLimitOutcome::Ok));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn kv_read_failure_disables_the_gate() {
        let kv = kv_store().await;
        kv.close_for_test().await;
        let inner = Arc::new(CountingRateLimit {
            calls: AtomicUsize::new(0),
            outcome: RateLimitOutcome::Limit,
        });
        let toggle = RateLimitToggle::new(inner.clone(), kv, Duration::from_secs(60));
        let outcome = toggle.check_and_increment("u1", None).await;
        assert!(matches!(outcome, RateLimitOutcome::Ok));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }
}
