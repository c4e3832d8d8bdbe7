//! Admin whitelist: a KV-backed set of admin user ids, cached
//! for `cache_ttl` with an explicit, targeted-or-whole invalidation
//! capability — mirroring the optional-capability pattern used for
//! `QueueStats` (`crate::ports::ai::QueueStats`).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::storage::KvStore;

const WHITELIST_KEY: &str = "whitelist";

#[derive(Deserialize)]
struct WhitelistPayload {
    whitelist: Vec<String>,
}

struct Cached {
    users: HashSet<String>,
    loaded_at: Instant,
}

pub struct AdminWhitelist {
    kv: Arc<KvStore>,
    cache_ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

impl AdminWhitelist {
    pub fn new(kv: Arc<KvStore>, cache_ttl: Duration) -> Self {
        Self {
            kv,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.load().await.contains(user_id)
    }

    async fn load(&self) -> HashSet<String> {
        let mut cache = self.cache.lock().await;
        if self.cache_ttl.is_zero() {
            return self.fetch().await;
        }
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.cache_ttl {
                return cached.users.clone();
            }
        }
        let users = self.fetch().await;
        *cache = Some(Cached {
            users: users.clone(),
            loaded_at: Instant::now(),
        });
        users
    }

    async fn fetch(&self) -> HashSet<String> {
        match self.kv.get(WHITELIST_KEY).await {
            Some(raw) => match serde_json::from_str::<WhitelistPayload>(&raw) {
                Ok(payload) => payload.whitelist.into_iter().collect(),
                Err(error) => {
                    warn!(%error, "admin whitelist JSON malformed, treating as empty");
                    HashSet::new()
                }
            },
            None => HashSet::new(),
        }
    }

    /// Drops the whole cache, or (reserved for future targeted eviction)
    /// a single user's membership — whole-cache invalidation is
    /// sufficient since the backing store has no per-user cache entries.
    pub async fn invalidate(&self, _user_id: Option<&str>) {
        *self.cache.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn kv_with_whitelist(json: &str) -> Arc<KvStore> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let kv = KvStore::new(pool);
        kv.ensure_schema().await.unwrap();
        kv.set(WHITELIST_KEY, json, None).await.unwrap();
        Arc::new(kv)
    }

    #[tokio::test]
    async fn parses_whitelist_and_checks_membership() {
        let kv = kv_with_whitelist(r#"{"whitelist":["u1","u2"]}"#).await;
        let whitelist = AdminWhitelist::new(kv, Duration::from_secs(30));
        assert!(whitelist.contains("u1").await);
        assert!(!whitelist.contains("u3").await);
    }

    #[tokio::test]
    async fn zero_ttl_rereads_every_call() {
        let kv = kv_with_whitelist(r#"{"whitelist":["u1"]}"#).await;
        let whitelist = AdminWhitelist::new(kv.clone(), Duration::ZERO);
        assert!(whitelist.contains("u1").await);
        kv.set(WHITELIST_KEY, r#"{"whitelist":["u2"]}"#, None)
            .await
            .unwrap();
        assert!(!whitelist.contains("u1").await);
        assert!(whitelist.contains("u2").await);
    }

    #[tokio::test]
    async fn invalidate_forces_a_reread_within_the_ttl_window() {
        let kv = kv_with_whitelist(r#"{"whitelist":["u1"]}"#).await;
        let whitelist = AdminWhitelist::new(kv.clone(), Duration::from_secs(300));
        assert!(whitelist.contains("u1").await);
        kv.set(WHITELIST_KEY, r#"{"whitelist":["u2"]}"#, None)
            .await
            .unwrap();
        assert!(!whitelist.contains("u2").await);
        whitelist.invalidate(None).await;
        assert!(whitelist.contains("u2").await);
    }
}
