// src/main.rs

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use dialog_worker::api::http::{admin, healthz, webhook};
use dialog_worker::{metrics, AppState, Config};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    metrics::init_metrics();

    let bind_address = config.bind_address();
    let state = Arc::new(AppState::new(config).await?);

    info!(
        bind_address,
        ai_queue_endpoints = state.config.ai_queue.base_urls.len(),
        "starting up"
    );

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/webhook/{secret}", post(webhook))
        .route("/admin/export", get(admin::export))
        .route("/admin/selftest", get(admin::selftest))
        .route("/admin/envz", get(admin::envz))
        .route("/admin/access", get(admin::access))
        .route("/admin/diag", get(admin::diag))
        .route("/admin/known-users/clear", get(admin::known_users_clear))
        .route("/admin/d1-stress", post(admin::d1_stress))
        .route(
            "/admin/broadcast-recipients",
            get(admin::list_broadcast_recipients).post(admin::add_broadcast_recipient),
        )
        .route(
            "/admin/broadcast-recipients/{chat_id}",
            delete(admin::remove_broadcast_recipient),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
