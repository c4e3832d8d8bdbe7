// src/state.rs
// Composition: wires concrete adapters into the engine,
// exposing a single entry point for request handling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::admin::{AdminCommandGate, AdminWhitelist, ExportSource};
use crate::ai_queue::AiQueue;
use crate::config::Config;
use crate::dialog::DialogEngine;
use crate::messaging::telegram::TelegramMessaging;
use crate::messaging::{Dispatcher, DispatcherConfig};
use crate::rate_limit::sqlite::RateLimitConfig as SqliteRateLimitConfig;
use crate::rate_limit::{Notifier, RateLimitToggle, SqliteRateLimit};
use crate::storage::{KvStore, SqliteStorage};

pub type Messenger = Dispatcher<TelegramMessaging>;
pub type EngineRateLimit = RateLimitToggle<SqliteRateLimit>;
pub type Engine = DialogEngine<EngineRateLimit, Messenger, SqliteStorage, AiQueue>;
pub type Gate = AdminCommandGate<SqliteRateLimit, Messenger>;

/// Everything a request handler needs, built once at startup from `Config`.
pub struct AppState {
    pub config: Arc<Config>,
    pub sqlite_pool: SqlitePool,
    pub kv: Arc<KvStore>,
    pub storage: Arc<SqliteStorage>,
    pub messaging: Arc<Messenger>,
    pub raw_rate_limit: Arc<SqliteRateLimit>,
    pub rate_limit: Arc<EngineRateLimit>,
    pub notifier: Arc<Notifier<Messenger>>,
    pub whitelist: Arc<AdminWhitelist>,
    pub ai_queue: Arc<AiQueue>,
    pub dialog: Arc<Engine>,
    pub admin_gate: Arc<Gate>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let connect_options: SqliteConnectOptions = config
            .database
            .url
            .parse()
            .context("invalid DATABASE_URL")?;
        let sqlite_pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect_with(connect_options.create_if_missing(true))
            .await
            .context("failed to connect to sqlite")?;

        let storage = Arc::new(SqliteStorage::new(sqlite_pool.clone()));
        storage.ensure_schema().await?;

        let kv = Arc::new(KvStore::new(sqlite_pool.clone()));
        kv.ensure_schema().await?;

        let ai_queue = Arc::new(AiQueue::new(config.ai_queue.clone()));

        let telegram = TelegramMessaging::new(&config.messaging.bot_token);
        let messaging = Arc::new(Dispatcher::new(
            telegram,
            DispatcherConfig {
                max_retries: config.messaging.max_retries,
                base_delay_ms: config.messaging.base_delay_ms,
                outbound_rate_per_minute: config.messaging.outbound_rate_per_minute,
            },
        )?);

        let raw_rate_limit = Arc::new(SqliteRateLimit::new(
            sqlite_pool.clone(),
            SqliteRateLimitConfig {
                max_per_window: config.rate_limit.max_per_window,
            },
        ));
        raw_rate_limit.ensure_schema().await?;

        let rate_limit = Arc::new(RateLimitToggle::new(
            raw_rate_limit.clone(),
            kv.clone(),
            Duration::from_millis(config.rate_limit.toggle_refresh_interval_ms),
        ));

        let notifier = Arc::new(Notifier::new(
            messaging.clone(),
            kv.clone(),
            config.rate_limit.notifier_window_ms,
        ));

        let whitelist = Arc::new(AdminWhitelist::new(
            kv.clone(),
            Duration::from_millis(config.admin.whitelist_cache_ttl_ms),
        ));

        let export_source = Arc::new(ExportSource::new(sqlite_pool.clone()));

        let dialog = Arc::new(DialogEngine::new(
            rate_limit.clone(),
            messaging.clone(),
            storage.clone(),
            ai_queue.clone(),
        ));

        let admin_gate = Arc::new(AdminCommandGate::new(
            raw_rate_limit.clone(),
            messaging.clone(),
            whitelist.clone(),
            kv.clone(),
            export_source,
        ));

        info!("composition wired: storage, messaging, ai queue, rate limit, admin gate");

        Ok(Self {
            config,
            sqlite_pool,
            kv,
            storage,
            messaging,
            raw_rate_limit,
            rate_limit,
            notifier,
            whitelist,
            ai_queue,
            dialog,
            admin_gate,
        })
    }
}
