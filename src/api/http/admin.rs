// src/api/http/admin.rs
// Diagnostic/management HTTP surface, separate from the Telegram-facing
// Admin Command Gate (`crate::admin::gate`). Authenticated by
// `x-admin-token` header or `?token=` query param.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::admin::export::{parse_range, ExportSource, PAGE_SIZE, ROW_LIMIT};
use crate::admin::BROADCAST_RECIPIENTS_KEY;
use crate::api::error::{ApiError, ApiResult};
use crate::ports::ai::QueueStats;
use crate::state::AppState;

fn token_from(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get("token").cloned())
}

/// Checks the supplied token against `expected`. 401 when absent, 403 on
/// mismatch.
fn require_token(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    expected: &str,
) -> ApiResult<()> {
    match token_from(headers, query) {
        None => Err(ApiError::unauthorized("missing admin token")),
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(ApiError::forbidden("admin token mismatch")),
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap, query: &HashMap<String, String>) -> ApiResult<()> {
    require_token(headers, query, &state.config.admin.admin_token)
}

/// `/export` accepts a dedicated token when configured, falling back to
/// the general admin token.
fn require_export_admin(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> ApiResult<()> {
    let expected = state
        .config
        .admin
        .export_admin_token
        .as_deref()
        .unwrap_or(&state.config.admin.admin_token);
    require_token(headers, query, expected)
}

pub async fn export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    require_export_admin(&state, &headers, &query)?;

    let (from, to) = parse_range(query.get("from").map(String::as_str), query.get("to").map(String::as_str))
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let limit: usize = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(PAGE_SIZE)
        .min(ROW_LIMIT);
    let cursor: Option<i64> = query.get("cursor").and_then(|v| v.parse().ok());

    let page = ExportSource::new(state.sqlite_pool.clone())
        .fetch_page(from, to, cursor, limit)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let mut response = (StatusCode::OK, page.csv).into_response();
    if let Some(next_cursor) = page.next_cursor {
        response.headers_mut().insert(
            "x-next-cursor",
            next_cursor.to_string().parse().expect("ascii header value"),
        );
    }
    response.headers_mut().insert(
        "x-utm-sources",
        json!(page.utm_sources)
            .to_string()
            .parse()
            .expect("ascii header value"),
    );
    Ok(response)
}

pub async fn selftest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &query)?;

    let db_ok = sqlx::query("SELECT 1")
        .fetch_one(&state.sqlite_pool)
        .await
        .is_ok();
    let queue_stats = state.ai_queue.queue_stats();

    Ok(Json(json!({
        "db": if db_ok { "ok" } else { "error" },
        "aiQueue": {
            "active": queue_stats.active,
            "queued": queue_stats.queued,
            "maxConcurrency": queue_stats.max_concurrency,
            "maxQueue": queue_stats.max_queue,
        },
    })))
}

pub async fn envz(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &query)?;

    Ok(Json(json!({
        "host": state.config.server.host,
        "port": state.config.server.port,
        "databaseUrl": state.config.database.url,
        "logLevel": state.config.logging.level,
        "aiQueueEndpoints": state.config.ai_queue.base_urls.len(),
        "rateLimitMaxPerWindow": state.config.rate_limit.max_per_window,
    })))
}

pub async fn access(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &query)?;

    Ok(Json(json!({
        "exportAdminTokenConfigured": state.config.admin.export_admin_token.is_some(),
        "whitelistCacheTtlMs": state.config.admin.whitelist_cache_ttl_ms,
    })))
}

#[derive(Deserialize)]
pub struct DiagQuery {
    q: Option<String>,
}

pub async fn diag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(raw_query): Query<HashMap<String, String>>,
    Query(diag_query): Query<DiagQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &raw_query)?;

    let result = match diag_query.q.as_deref() {
        Some("bindings") => json!({
            "bindAddress": state.config.bind_address(),
            "databaseUrl": state.config.database.url,
        }),
        Some("telegram.getMe") => diag_telegram_get_me(&state.config.messaging.bot_token).await,
        Some("ai-queue") => {
            let stats = state.ai_queue.queue_stats();
            json!({
                "active": stats.active,
                "queued": stats.queued,
                "droppedSinceBoot": stats.dropped_since_boot,
                "avgWaitMs": stats.avg_wait_ms,
                "lastDropAt": stats.last_drop_at,
            })
        }
        Some("export-rate") => {
            let limits_enabled = state.kv.get("LIMITS_ENABLED").await;
            json!({
                "maxPerWindow": state.config.rate_limit.max_per_window,
                "limitsEnabled": limits_enabled.unwrap_or_else(|| "true".to_string()),
            })
        }
        other => json!({"error": format!("unknown diag target: {other:?}")}),
    };

    Ok(Json(result))
}

async fn diag_telegram_get_me(bot_token: &str) -> serde_json::Value {
    let url = format!("https://api.telegram.org/bot{bot_token}/getMe");
    match reqwest::get(&url).await {
        Ok(response) => response
            .json::<serde_json::Value>()
            .await
            .unwrap_or_else(|e| json!({"error": e.to_string()})),
        Err(error) => json!({"error": error.to_string()}),
    }
}

pub async fn known_users_clear(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &query)?;

    let result = sqlx::query("DELETE FROM users")
        .execute(&state.sqlite_pool)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(json!({"cleared": result.rows_affected()})))
}

#[derive(Deserialize)]
pub struct StressQuery {
    #[serde(default = "default_stress_rows")]
    n: usize,
}

fn default_stress_rows() -> usize {
    100
}

pub async fn d1_stress(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(raw_query): Query<HashMap<String, String>>,
    Query(stress_query): Query<StressQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &raw_query)?;

    let started = std::time::Instant::now();
    for i in 0..stress_query.n {
        let key = format!("d1-stress:{i}");
        state
            .kv
            .set(&key, "stress", Some(60))
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
    }
    let elapsed_ms = started.elapsed().as_millis();

    Ok(Json(json!({"rows": stress_query.n, "elapsedMs": elapsed_ms})))
}

#[derive(Deserialize)]
pub struct AddRecipient {
    #[serde(rename = "chatId")]
    chat_id: String,
}

async fn load_recipients(state: &AppState) -> Vec<String> {
    match state.kv.get(BROADCAST_RECIPIENTS_KEY).await {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        None => Vec::new(),
    }
}

async fn save_recipients(state: &AppState, recipients: &[String]) -> ApiResult<()> {
    state
        .kv
        .set(BROADCAST_RECIPIENTS_KEY, &json!(recipients).to_string(), None)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))
}

pub async fn list_broadcast_recipients(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &query)?;
    Ok(Json(json!({"recipients": load_recipients(&state).await})))
}

pub async fn add_broadcast_recipient(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<AddRecipient>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &query)?;

    let mut recipients = load_recipients(&state).await;
    if !recipients.contains(&body.chat_id) {
        recipients.push(body.chat_id);
    }
    save_recipients(&state, &recipients).await?;
    Ok(Json(json!({"recipients": recipients})))
}

pub async fn remove_broadcast_recipient(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers, &query)?;

    let mut recipients = load_recipients(&state).await;
    recipients.retain(|id| id != &chat_id);
    save_recipients(&state, &recipients).await?;
    Ok(Json(json!({"recipients": recipients})))
}
