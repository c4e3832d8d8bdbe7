use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sqlx::SqlitePool;
use tracing::warn;

use crate::ports::rate_limit::{RateLimit, RateLimitOutcome};

/// Window over which requests are counted, matching the 24h notifier TTL.
const WINDOW_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_per_window: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_per_window: 20 }
    }
}

pub struct SqliteRateLimit {
    pool: SqlitePool,
    config: RateLimitConfig,
}

impl SqliteRateLimit {
    pub fn new(pool: SqlitePool, config: RateLimitConfig) -> Self {
        Self { pool, config }
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_hits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                context TEXT,
                hit_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rate_limit_hits_user_ts ON rate_limit_hits(user_id, hit_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_in_window(&self, user_id: &str, context: Option<&str>) -> Result<i64, sqlx::Error> {
        let since = Utc::now().timestamp() - WINDOW_SECONDS;
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM rate_limit_hits WHERE user_id = ?1 AND context IS ?2 AND hit_at > ?3",
        )
        .bind(user_id)
        .bind(context)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn record_hit(&self, user_id: &str, context: Option<&str>) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO rate_limit_hits (user_id, context, hit_at) VALUES (?1, ?2, ?3)")
            .bind(user_id)
            .bind(context)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimit for SqliteRateLimit {
    async fn check_and_increment(&self, user_id: &str, context: Option<&str>) -> RateLimitOutcome {
        let count = match self.count_in_window(user_id, context).await {
            Ok(count) => count,
            Err(error) => {
                warn!(%error, user_id, "rate limit count query failed, degrading to ok");
                return RateLimitOutcome::Ok;
            }
        };

        if count >= self.config.max_per_window {
            counter!("worker_rate_limited_total").increment(1);
            return RateLimitOutcome::Limit;
        }

        if let Err(error) = self.record_hit(user_id, context).await {
            warn!(%error, user_id, "rate limit hit insert failed, degrading to ok");
        }

        RateLimitOutcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let limiter = SqliteRateLimit::new(pool.clone(), RateLimitConfig { max_per_window: 2 });
        limiter.ensure_schema().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn allows_requests_under_the_window_limit() {
        let pool = test_pool().await;
        let limiter = SqliteRateLimit::new(pool, RateLimitConfig { max_per_window: 2 });
        assert!(matches!(
            limiter.check_and_increment("u1", None).await,
            RateLimitOutcome::Ok
        ));
        assert!(matches!(
            limiter.check_and_increment("u1", None).await,
            RateLimitOutcome::Ok
        ));
    }

    #[tokio::test]
    async fn rejects_once_the_window_limit_is_reached() {
        let pool = test_pool().await;
        let limiter = SqliteRateLimit::new(pool, RateLimitConfig { max_per_window: 2 });
        limiter.check_and_increment("u1", None).await;
        limiter.check_and_increment("u1", None).await;
        assert!(matches!(
            limiter.check_and_increment("u1", None).await,
            RateLimitOutcome::Limit
        ));
    }

    #[tokio::test]
    async fn contexts_are_tracked_independently() {
        let pool = test_pool().await;
        let limiter = SqliteRateLimit::new(pool, RateLimitConfig { max_per_window: 1 });
        assert!(matches!(
            limiter.check_and_increment("u1", Some("export")).await,
            RateLimitOutcome::Ok
        ));
        assert!(matches!(
            limiter.check_and_increment("u1", None).await,
            RateLimitOutcome::Ok
        ));
        assert!(matches!(
            limiter.check_and_increment("u1", Some("export")).await,
            RateLimitOutcome::Limit
        ));
    }
}
