//! Concrete `Storage` port backed by SQLite.
//!
//! Grounded 1:1 in shape on the reference backend's
//! `memory::storage::sqlite::core` operations (insert-then-return-id,
//! `ORDER BY timestamp DESC, id DESC` then reverse, JSON-serialized side
//! columns) generalized to a `UserProfile`/`StoredMessage` model,
//! plus a retry/backoff/utm-degradation controller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{info, warn};

use crate::ports::{SaveUserOutcome, Storage, StorageError, StoredMessage, StoredRole, UserProfile};

use super::canonical::canonical_string;
use super::retry::{backoff_delay, is_retryable, is_utm_column_missing, random_jitter_fraction, MAX_ATTEMPTS};

/// How many `save_user` attempts between re-probing the schema once the
/// utm_source fallback is active (open question: exact reset
/// semantics on success vs failure are left to this implementation — we
/// reset the counter on every probe, successful or not, so the interval is
/// a fixed cadence rather than a backoff-on-failure one).
const UTM_COLUMN_RECHECK_INTERVAL: u32 = 20;

pub struct SqliteStorage {
    pool: SqlitePool,
    utm_degraded: AtomicBool,
    attempts_since_recheck: AtomicU32,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            utm_degraded: AtomicBool::new(false),
            attempts_since_recheck: AtomicU32::new(0),
        }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                language_code TEXT,
                utm_source TEXT,
                metadata TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                thread_id TEXT,
                role TEXT NOT NULL CHECK (role IN ('user','assistant','system')),
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                metadata TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_user_ts ON messages(user_id, timestamp DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_chat_thread_ts ON messages(chat_id, thread_id, timestamp DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn utm_column_present(&self) -> bool {
        let rows = sqlx::query("PRAGMA table_info(users)")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();
        rows.iter()
            .any(|row| row.get::<String, _>("name") == "utm_source")
    }

    async fn maybe_recheck_schema(&self) {
        if !self.utm_degraded.load(Ordering::SeqCst) {
            return;
        }
        let count = self.attempts_since_recheck.fetch_add(1, Ordering::SeqCst) + 1;
        if count < UTM_COLUMN_RECHECK_INTERVAL {
            return;
        }
        self.attempts_since_recheck.store(0, Ordering::SeqCst);
        if self.utm_column_present().await {
            info!("utm_source column restored, re-enabling usage");
            self.utm_degraded.store(false, Ordering::SeqCst);
        }
    }

    async fn insert_user_with_utm(&self, profile: &UserProfile, now: i64) -> Result<(), String> {
        let metadata_json = profile.metadata.as_ref().map(|m| m.to_string());
        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, first_name, last_name, language_code, utm_source, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                language_code = excluded.language_code,
                utm_source = COALESCE(excluded.utm_source, users.utm_source),
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.language_code)
        .bind(&profile.utm_source)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
    }

    async fn insert_user_without_utm(&self, profile: &UserProfile, now: i64) -> Result<(), String> {
        let metadata_json = profile.metadata.as_ref().map(|m| m.to_string());
        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, first_name, last_name, language_code, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                language_code = excluded.language_code,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.language_code)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
    }

    async fn find_duplicate_message_id(
        &self,
        user_id: &str,
        canonical_metadata: &str,
    ) -> Option<i64> {
        // Metadata-less inserts store NULL, not '', so the empty-string case
        // has to match NULL explicitly or it would never dedupe.
        sqlx::query(
            "SELECT id FROM messages WHERE user_id = ? AND (metadata = ? OR (metadata IS NULL AND ? = ''))",
        )
        .bind(user_id)
        .bind(canonical_metadata)
        .bind(canonical_metadata)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .map(|row| row.get("id"))
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_user(&self, profile: &UserProfile) -> Result<SaveUserOutcome, StorageError> {
        let now = Utc::now().timestamp();
        let mut attempt = 0u32;

        loop {
            let degraded = self.utm_degraded.load(Ordering::SeqCst);
            let result = if degraded {
                self.insert_user_without_utm(profile, now).await
            } else {
                self.insert_user_with_utm(profile, now).await
            };

            match result {
                Ok(()) => {
                    self.maybe_recheck_schema().await;
                    return Ok(SaveUserOutcome {
                        utm_degraded: self.utm_degraded.load(Ordering::SeqCst),
                    });
                }
                Err(message) if !degraded && is_utm_column_missing(&message) => {
                    warn!("utm_source column missing, disabling usage");
                    self.utm_degraded.store(true, Ordering::SeqCst);
                    self.attempts_since_recheck.store(0, Ordering::SeqCst);
                    // Schema transition, not a generic retry: fall through
                    // to the reduced column set on the next loop iteration
                    // without consuming an attempt slot.
                    continue;
                }
                Err(message) if is_retryable(&message) && attempt + 1 < MAX_ATTEMPTS => {
                    counter!("worker_storage_retries_total", "op" => "save_user").increment(1);
                    let delay = backoff_delay(attempt, random_jitter_fraction());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(message) if is_retryable(&message) => {
                    warn!(error = %message, "save_user exhausted retries");
                    return Err(StorageError::RetriesExhausted(message));
                }
                Err(message) => {
                    return Err(StorageError::NonRetryable(message));
                }
            }
        }
    }

    async fn append_message(&self, message: &StoredMessage) -> Result<i64, StorageError> {
        let canonical_metadata = message
            .metadata
            .as_ref()
            .map(canonical_string)
            .unwrap_or_default();

        if let Some(existing_id) = self
            .find_duplicate_message_id(&message.user_id, &canonical_metadata)
            .await
        {
            return Ok(existing_id);
        }

        let mut attempt = 0u32;
        loop {
            let result = sqlx::query(
                r#"
                INSERT INTO messages (user_id, chat_id, thread_id, role, text, timestamp, metadata, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&message.user_id)
            .bind(&message.chat_id)
            .bind(&message.thread_id)
            .bind(role_str(&message.role))
            .bind(&message.text)
            .bind(message.timestamp.timestamp())
            .bind(if canonical_metadata.is_empty() {
                None
            } else {
                Some(canonical_metadata.clone())
            })
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await;

            match result {
                Ok(outcome) => return Ok(outcome.last_insert_rowid()),
                Err(e) if is_retryable(&e.to_string()) && attempt + 1 < MAX_ATTEMPTS => {
                    counter!("worker_storage_retries_total", "op" => "append_message").increment(1);
                    let delay = backoff_delay(attempt, random_jitter_fraction());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if is_retryable(&e.to_string()) => {
                    warn!(error = %e, "append_message exhausted retries");
                    return Err(StorageError::RetriesExhausted(e.to_string()));
                }
                Err(e) => return Err(StorageError::NonRetryable(e.to_string())),
            }
        }
    }

    async fn get_recent_messages(&self, user_id: &str, limit: usize) -> Vec<StoredMessage> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, chat_id, thread_id, role, text, timestamp, metadata
            FROM messages
            WHERE user_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await;

        let mut rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to load recent messages");
                return Vec::new();
            }
        };
        rows.reverse();

        rows.into_iter()
            .filter_map(|row| {
                let role = parse_role(row.get::<String, _>("role").as_str())?;
                let timestamp_raw: i64 = row.get("timestamp");
                let metadata_raw: Option<String> = row.get("metadata");
                Some(StoredMessage {
                    user_id: row.get("user_id"),
                    chat_id: row.get("chat_id"),
                    thread_id: row.get("thread_id"),
                    role,
                    text: row.get("text"),
                    timestamp: DateTime::from_timestamp(timestamp_raw, 0)
                        .unwrap_or_else(Utc::now)
                        .with_timezone(&Utc),
                    metadata: metadata_raw.and_then(|m| serde_json::from_str::<Value>(&m).ok()),
                })
            })
            .collect()
    }
}

fn role_str(role: &StoredRole) -> &'static str {
    role.as_str()
}

fn parse_role(s: &str) -> Option<StoredRole> {
    match s {
        "user" => Some(StoredRole::User),
        "assistant" => Some(StoredRole::Assistant),
        "system" => Some(StoredRole::System),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteStorage {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteStorage::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn saves_and_preserves_utm_source_write_once() {
        let store = store().await;
        let mut profile = UserProfile {
            user_id: "u1".into(),
            utm_source: Some("ads".into()),
            ..Default::default()
        };
        store.save_user(&profile).await.unwrap();

        profile.utm_source = None;
        store.save_user(&profile).await.unwrap();

        let row = sqlx::query("SELECT utm_source FROM users WHERE user_id = ?")
            .bind("u1")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let utm: Option<String> = row.get("utm_source");
        assert_eq!(utm, Some("ads".to_string()));
    }

    #[tokio::test]
    async fn append_message_is_idempotent_under_identical_metadata() {
        let store = store().await;
        let msg = StoredMessage {
            user_id: "u1".into(),
            chat_id: "c1".into(),
            thread_id: None,
            role: StoredRole::User,
            text: "hi".into(),
            timestamp: Utc::now(),
            metadata: Some(json!({"messageId": "m1"})),
        };
        let id1 = store.append_message(&msg).await.unwrap();
        let id2 = store.append_message(&msg).await.unwrap();
        assert_eq!(id1, id2);

        let count: i64 = sqlx::query("SELECT COUNT(*) as c FROM messages")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn append_message_is_idempotent_without_metadata() {
        let store = store().await;
        let msg = StoredMessage {
            user_id: "u1".into(),
            chat_id: "c1".into(),
            thread_id: None,
            role: StoredRole::User,
            text: "hi".into(),
            timestamp: Utc::now(),
            metadata: None,
        };
        let id1 = store.append_message(&msg).await.unwrap();
        let id2 = store.append_message(&msg).await.unwrap();
        assert_eq!(id1, id2);

        let count: i64 = sqlx::query("SELECT COUNT(*) as c FROM messages")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn get_recent_messages_is_ascending_by_timestamp() {
        let store = store().await;
        for (i, text) in ["a", "b", "c"].into_iter().enumerate() {
            let msg = StoredMessage {
                user_id: "u1".into(),
                chat_id: "c1".into(),
                thread_id: None,
                role: StoredRole::User,
                text: text.into(),
                timestamp: Utc::now() + chrono::Duration::seconds(i as i64),
                metadata: Some(json!({"i": i})),
            };
            store.append_message(&msg).await.unwrap();
        }

        let recent = store.get_recent_messages("u1", 10).await;
        let texts: Vec<&str> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn get_recent_messages_respects_limit() {
        let store = store().await;
        for i in 0..5 {
            let msg = StoredMessage {
                user_id: "u1".into(),
                chat_id: "c1".into(),
                thread_id: None,
                role: StoredRole::User,
                text: format!("m{i}"),
                timestamp: Utc::now() + chrono::Duration::seconds(i),
                metadata: Some(json!({"i": i})),
            };
            store.append_message(&msg).await.unwrap();
        }
        let recent = store.get_recent_messages("u1", 2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "m3");
        assert_eq!(recent[1].text, "m4");
    }
}
