//! Admin Command Gate: command routing, whitelist
//! enforcement, cooldown + rate-limit, paginated export, and error
//! telemetry.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::ports::messaging::{Chat, DispatchError, Messaging};
use crate::ports::rate_limit::{RateLimit, RateLimitOutcome};
use crate::storage::KvStore;

use super::export::{merge_pages, parse_range, ExportError, ExportSource, PAGE_SIZE, ROW_LIMIT};
use super::whitelist::AdminWhitelist;
use super::BROADCAST_RECIPIENTS_KEY;

const EXPORT_COOLDOWN_SECONDS: i64 = 60;
const DEDUP_START_TTL_SECONDS: i64 = 60;
const ADMIN_ERROR_TTL_SECONDS: i64 = 10 * 24 * 60 * 60;
const ADMIN_ERROR_RATE_TTL_SECONDS: i64 = 60;
const EXPORT_LOG_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandScope {
    Global,
    Scoped,
}

pub fn scope_for(command: &str) -> Option<CommandScope> {
    match command {
        "start" => Some(CommandScope::Global),
        "admin" | "export" | "broadcast" => Some(CommandScope::Scoped),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Silent,
    Reply(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct CooldownEntry {
    expires_at: i64,
    notice_sent_at: Option<i64>,
}

pub struct AdminCommandGate<R: RateLimit, M: Messaging> {
    rate_limit: Arc<R>,
    messaging: Arc<M>,
    whitelist: Arc<AdminWhitelist>,
    kv: Arc<KvStore>,
    export_source: Arc<ExportSource>,
}

impl<R: RateLimit, M: Messaging> AdminCommandGate<R, M> {
    pub fn new(
        rate_limit: Arc<R>,
        messaging: Arc<M>,
        whitelist: Arc<AdminWhitelist>,
        kv: Arc<KvStore>,
        export_source: Arc<ExportSource>,
    ) -> Self {
        Self {
            rate_limit,
            messaging,
            whitelist,
            kv,
            export_source,
        }
    }

    pub async fn handle(
        &self,
        user_id: &str,
        chat: &Chat,
        command: &str,
        args: &[&str],
        update_id: Option<&str>,
    ) -> CommandOutcome {
        counter!("worker_admin_command_total").increment(1);

        let Some(scope) = scope_for(command) else {
            return CommandOutcome::Silent;
        };

        if scope == CommandScope::Global {
            return self.handle_global(command, update_id).await;
        }

        if !self.whitelist.contains(user_id).await {
            // `/export`'s role mismatch is silent; every other scoped
            // command replies so the caller knows the command was seen
            // and rejected, not dropped.
            return if command == "export" {
                CommandOutcome::Silent
            } else {
                CommandOutcome::Reply("you're not authorized to use this command".to_string())
            };
        }

        match command {
            "admin" => self.handle_admin_status(args),
            "export" => self.handle_export(user_id, chat, args).await,
            "broadcast" => self.handle_broadcast(args).await,
            _ => CommandOutcome::Silent,
        }
    }

    async fn handle_global(&self, command: &str, update_id: Option<&str>) -> CommandOutcome {
        match command {
            "start" => {
                if let Some(update_id) = update_id {
                    let key = format!("dedup:start:{update_id}");
                    match self.kv.set_if_absent(&key, "1", DEDUP_START_TTL_SECONDS).await {
                        Ok(false) => return CommandOutcome::Silent,
                        Ok(true) | Err(_) => {}
                    }
                }
                CommandOutcome::Reply("Hi! Send me a message and I'll reply.".to_string())
            }
            _ => CommandOutcome::Silent,
        }
    }

    fn handle_admin_status(&self, args: &[&str]) -> CommandOutcome {
        if args.first() == Some(&"status") {
            CommandOutcome::Reply("ok".to_string())
        } else {
            CommandOutcome::Reply("admin commands: status, export, broadcast".to_string())
        }
    }

    /// Sends `args` joined as text to every chat id in the
    /// `broadcast_recipients` KV list (the same list the HTTP
    /// `/admin/broadcast-recipients` CRUD surface manages).
    async fn handle_broadcast(&self, args: &[&str]) -> CommandOutcome {
        if args.is_empty() {
            return CommandOutcome::Reply("usage: /broadcast <message>".to_string());
        }
        let text = args.join(" ");

        let recipients: Vec<String> = match self.kv.get(BROADCAST_RECIPIENTS_KEY).await {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        if recipients.is_empty() {
            return CommandOutcome::Reply("no broadcast recipients configured".to_string());
        }

        let mut sent = 0usize;
        for chat_id in &recipients {
            let chat = Chat::new(chat_id.clone());
            match self.messaging.send_text(&chat, &text).await {
                Ok(_) => sent += 1,
                Err(error) => warn!(%error, chat_id, "broadcast send failed"),
            }
        }

        CommandOutcome::Reply(format!(
            "broadcast sent to {sent}/{} recipients",
            recipients.len()
        ))
    }

    async fn handle_export(&self, user_id: &str, chat: &Chat, args: &[&str]) -> CommandOutcome {
        let (from, to) = match parse_range(args.first().copied(), args.get(1).copied()) {
            Ok(range) => range,
            Err(ExportError::InvalidRange) | Err(ExportError::InvalidDate(_)) => {
                return CommandOutcome::Reply("invalid date range".to_string());
            }
            Err(ExportError::Query(_)) => {
                return CommandOutcome::Reply("export failed".to_string());
            }
        };

        if matches!(
            self.rate_limit
                .check_and_increment(user_id, Some("admin_export"))
                .await,
            RateLimitOutcome::Limit
        ) {
            return CommandOutcome::Silent;
        }

        if let Some(notice) = self.enforce_cooldown(user_id).await {
            return notice;
        }

        let mut pages = Vec::new();
        let mut collected = 0usize;
        let mut cursor = None;
        let mut utm_sources = Vec::new();
        let mut truncated = false;

        loop {
            let page_size = PAGE_SIZE.min(ROW_LIMIT - collected);
            if page_size == 0 {
                truncated = true;
                break;
            }
            let page = match self.export_source.fetch_page(from, to, cursor, page_size).await {
                Ok(page) => page,
                Err(error) => {
                    warn!(%error, user_id, "export query failed");
                    return CommandOutcome::Reply("export failed".to_string());
                }
            };
            collected += page.row_count;
            for utm in page.utm_sources {
                if !utm_sources.contains(&utm) {
                    utm_sources.push(utm);
                }
            }
            pages.push(page.csv);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
            if collected >= ROW_LIMIT {
                truncated = true;
                break;
            }
        }

        if collected == 0 {
            return CommandOutcome::Reply("export produced no rows for that range".to_string());
        }

        let merged = merge_pages(&pages);
        if let Err(error) = self
            .messaging
            .send_document(chat, "export.csv", merged.into_bytes())
            .await
        {
            self.record_admin_error(user_id, "export", &error).await;
            return CommandOutcome::Reply("export upload failed".to_string());
        }

        self.log_export(user_id, &chat.id, &from.to_string(), &to.to_string(), collected, &utm_sources)
            .await;

        if truncated {
            CommandOutcome::Reply(format!("export truncated at {ROW_LIMIT} rows"))
        } else {
            CommandOutcome::Reply(format!("export complete: {collected} rows"))
        }
    }

    async fn enforce_cooldown(&self, user_id: &str) -> Option<CommandOutcome> {
        let key = format!("rate-limit:{user_id}");
        let now = Utc::now().timestamp();

        let existing = self
            .kv
            .get(&key)
            .await
            .and_then(|raw| serde_json::from_str::<CooldownEntry>(&raw).ok());

        if let Some(entry) = existing {
            if entry.expires_at > now {
                if entry.notice_sent_at.is_none() {
                    let updated = CooldownEntry {
                        expires_at: entry.expires_at,
                        notice_sent_at: Some(now),
                    };
                    let _ = self
                        .kv
                        .set(&key, &json!(updated).to_string(), Some(EXPORT_COOLDOWN_SECONDS))
                        .await;
                    return Some(CommandOutcome::Reply(
                        "please wait 60 seconds before exporting again".to_string(),
                    ));
                }
                return Some(CommandOutcome::Silent);
            }
        }

        let entry = CooldownEntry {
            expires_at: now + EXPORT_COOLDOWN_SECONDS,
            notice_sent_at: None,
        };
        let _ = self
            .kv
            .set(&key, &json!(entry).to_string(), Some(EXPORT_COOLDOWN_SECONDS))
            .await;
        None
    }

    async fn record_admin_error(&self, user_id: &str, command: &str, error: &DispatchError) {
        let status = match error {
            DispatchError::Upstream { status, .. } => Some(*status),
            _ => None,
        };

        let rate_key = format!("admin-error-rate:{user_id}:{command}");
        if self.kv.get(&rate_key).await.is_some() {
            return;
        }
        let _ = self
            .kv
            .set(&rate_key, "1", Some(ADMIN_ERROR_RATE_TTL_SECONDS))
            .await;

        let when = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let record_key = format!("admin-error:{user_id}:{when}");
        let record = json!({
            "userId": user_id,
            "command": command,
            "code": status,
            "when": when,
            "desc": error.to_string(),
        });
        let _ = self
            .kv
            .set(&record_key, &record.to_string(), Some(ADMIN_ERROR_TTL_SECONDS))
            .await;

        if matches!(status, Some(400) | Some(403)) {
            self.whitelist.invalidate(None).await;
        }
    }

    async fn log_export(
        &self,
        user_id: &str,
        chat_id: &str,
        from: &str,
        to: &str,
        row_count: usize,
        utm_sources: &[String],
    ) {
        let key = format!("log:{}:{user_id}", Utc::now().to_rfc3339());
        let record = json!({
            "userId": user_id,
            "chatId": chat_id,
            "from": from,
            "to": to,
            "rowCount": row_count,
            "utmSources": utm_sources,
        });
        let _ = self
            .kv
            .set(&key, &record.to_string(), Some(EXPORT_LOG_TTL_SECONDS))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::messaging::Chat;
    use crate::ports::noop::{NoopMessaging, NoopRateLimit};
    use sqlx::SqlitePool;
    use std::time::Duration;

    #[test]
    fn scope_for_classifies_known_commands() {
        assert_eq!(scope_for("start"), Some(CommandScope::Global));
        assert_eq!(scope_for("export"), Some(CommandScope::Scoped));
        assert_eq!(scope_for("unknown"), None);
    }

    async fn gate() -> AdminCommandGate<NoopRateLimit, NoopMessaging> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let kv = Arc::new(KvStore::new(pool.clone()));
        kv.ensure_schema().await.unwrap();
        let whitelist = Arc::new(AdminWhitelist::new(kv.clone(), Duration::from_secs(30)));
        let export_source = Arc::new(ExportSource::new(pool));
        AdminCommandGate::new(
            Arc::new(NoopRateLimit),
            Arc::new(NoopMessaging),
            whitelist,
            kv,
            export_source,
        )
    }

    #[tokio::test]
    async fn start_replies_once_per_update_id() {
        let gate = gate().await;
        let chat = Chat::new("c1");

        let first = gate.handle("u1", &chat, "start", &[], Some("1")).await;
        assert!(matches!(first, CommandOutcome::Reply(_)));

        let second = gate.handle("u1", &chat, "start", &[], Some("1")).await;
        assert_eq!(second, CommandOutcome::Silent);
    }

    #[tokio::test]
    async fn start_without_update_id_always_replies() {
        let gate = gate().await;
        let chat = Chat::new("c1");

        let first = gate.handle("u1", &chat, "start", &[], None).await;
        let second = gate.handle("u1", &chat, "start", &[], None).await;
        assert!(matches!(first, CommandOutcome::Reply(_)));
        assert!(matches!(second, CommandOutcome::Reply(_)));
    }

    #[tokio::test]
    async fn non_whitelisted_user_gets_a_reply_on_non_export_scoped_commands() {
        let gate = gate().await;
        let chat = Chat::new("c1");

        let admin = gate.handle("u1", &chat, "admin", &["status"], None).await;
        assert!(matches!(admin, CommandOutcome::Reply(_)));

        let broadcast = gate.handle("u1", &chat, "broadcast", &["hi"], None).await;
        assert!(matches!(broadcast, CommandOutcome::Reply(_)));
    }

    #[tokio::test]
    async fn non_whitelisted_user_on_export_stays_silent() {
        let gate = gate().await;
        let chat = Chat::new("c1");

        let export = gate.handle("u1", &chat, "export", &[], None).await;
        assert_eq!(export, CommandOutcome::Silent);
    }

    struct RecordingMessaging {
        sent: parking_lot::Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl Messaging for RecordingMessaging {
        async fn send_typing(&self, _chat: &Chat) {}

        async fn send_text(&self, chat: &Chat, text: &str) -> Result<String, DispatchError> {
            self.sent.lock().push((chat.id.clone(), text.to_string()));
            Ok("sent".to_string())
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

    async fn gate_with_recording_messaging() -> (AdminCommandGate<NoopRateLimit, RecordingMessaging>, Arc<KvStore>) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let kv = Arc::new(KvStore::new(pool.clone()));
        kv.ensure_schema().await.unwrap();
        let whitelist = Arc::new(AdminWhitelist::new(kv.clone(), Duration::from_secs(30)));
        let export_source = Arc::new(ExportSource::new(pool));
        let gate = AdminCommandGate::new(
            Arc::new(NoopRateLimit),
            Arc::new(RecordingMessaging {
                sent: parking_lot::Mutex::new(Vec::new()),
            }),
            whitelist.clone(),
            kv.clone(),
            export_source,
        );
        kv.set("whitelist", r#"{"whitelist":["u1"]}"#, None)
            .await
            .unwrap();
        whitelist.invalidate(None).await;
        (gate, kv)
    }

    #[tokio::test]
    async fn broadcast_sends_to_every_recorded_recipient() {
        let (gate, kv) = gate_with_recording_messaging().await;
        kv.set(
            BROADCAST_RECIPIENTS_KEY,
            &json!(["c1", "c2"]).to_string(),
            None,
        )
        .await
        .unwrap();
        let chat = Chat::new("admin-chat");

        let outcome = gate.handle("u1", &chat, "broadcast", &["hello", "there"], None).await;

        assert_eq!(
            outcome,
            CommandOutcome::Reply("broadcast sent to 2/2 recipients".to_string())
        );
        let sent = gate.messaging.sent.lock().clone();
        assert_eq!(
            sent,
            vec![
                ("c1".to_string(), "hello there".to_string()),
                ("c2".to_string(), "hello there".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn broadcast_with_no_recipients_does_not_claim_success() {
        let (gate, _kv) = gate_with_recording_messaging().await;
        let chat = Chat::new("admin-chat");

        let outcome = gate.handle("u1", &chat, "broadcast", &["hello"], None).await;

        assert_eq!(
            outcome,
            CommandOutcome::Reply("no broadcast recipients configured".to_string())
        );
    }
}
