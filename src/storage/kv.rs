//! Generic TTL-backed key/value store.
//!
//! Grounded on the reference backend's `LlmCache` (expiry-checked SQL-backed
//! cache, `ON CONFLICT DO UPDATE` upsert) generalized from "one LLM response
//! per request hash" to "arbitrary string key -> JSON value with optional
//! expiry", which is what the `LIMITS_ENABLED`, `whitelist`,
//! `rate-limit:<userId>`, `admin-error:*`, `log:*` and `dedup:start:*` keys
//! all need.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.try_get(key).await.ok().flatten()
    }

    /// Like `get`, but surfaces a query failure instead of collapsing it
    /// into `None` — callers that must distinguish "key absent" from
    /// "couldn't reach the store" (the `LIMITS_ENABLED` toggle) use this.
    pub async fn try_get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp();
        let row = sqlx::query("SELECT value, expires_at FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: Option<i64> = row.get("expires_at");
        if let Some(exp) = expires_at {
            if now >= exp {
                debug!(key, "kv entry expired");
                let _ = self.delete(key).await;
                return Ok(None);
            }
        }
        Ok(Some(row.get("value")))
    }

    pub async fn set(&self, key: &str, value: &str, ttl_seconds: Option<i64>) -> Result<()> {
        let expires_at = ttl_seconds.map(|ttl| Utc::now().timestamp() + ttl);
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns true if the key was newly set (did not already exist).
    /// Used for the `dedup:start:<updateId>` idempotency key.
    pub async fn set_if_absent(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<bool> {
        if self.get(key).await.is_some() {
            return Ok(false);
        }
        self.set(key, value, Some(ttl_seconds)).await?;
        Ok(true)
    }
}

#[cfg(test)]
impl KvStore {
    /// Closes the underlying pool so subsequent queries fail, for
    /// exercising `try_get`'s error path.
    pub(crate) async fn close_for_test(&self) {
        self.pool.close().await;
    }
}
