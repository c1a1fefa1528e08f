//! HTTP server assembly, background tasks and lifecycle.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::relay::selector;
use crate::{cache, config, consume, logger, relay, store};

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

fn admin_authorized(headers: &HeaderMap) -> bool {
    let Some(expected) = config::load().admin_key.clone() else {
        return false;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|key| key.trim() == expected)
        .unwrap_or(false)
}

/// Operational status for the admin surface: cache population, buffered
/// consumption depth, auto-disabled channels.
async fn status(headers: HeaderMap) -> Response {
    if !admin_authorized(&headers) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            Json(json!({"error": "admin key required"})),
        )
            .into_response();
    }
    let disabled: Vec<serde_json::Value> = selector::auto_disabled_channels()
        .into_iter()
        .map(|(id, entry)| {
            json!({"channel_id": id, "reason": entry.reason, "since": entry.since_unix})
        })
        .collect();
    Json(json!({
        "models": cache::known_models().len(),
        "consume_buffer_depth": consume::pipeline().depth(),
        "auto_disabled_channels": disabled,
    }))
    .into_response()
}

pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/completions", post(relay::completions))
        .route("/v1/messages", post(relay::anthropic_messages))
        .route("/v1/responses", post(relay::responses_create))
        .route("/v1beta/models/:model_action", post(relay::gemini_generate))
        .route("/v1/embeddings", post(relay::embeddings))
        .route("/v1/images/generations", post(relay::images_generations))
        .route("/v1/audio/speech", post(relay::audio_speech))
        .route("/v1/rerank", post(relay::rerank))
        .route("/v1/models", get(relay::list_models))
        .route("/v1/models/:model_id", get(relay::get_model))
        .route(
            "/v1/dashboard/billing/subscription",
            get(relay::billing_subscription),
        )
        .route("/v1/dashboard/billing/usage", get(relay::billing_usage))
        .layer(CorsLayer::permissive())
}

/// Re-probe auto-disabled channels once a minute. Any completed HTTP
/// exchange below 500 proves the endpoint is reachable again; model-level
/// health is left to real traffic.
fn spawn_channel_probe() {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("probe client");
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            for (channel_id, _entry) in selector::auto_disabled_channels() {
                let Some(channel) = cache::channel_by_id(channel_id) else {
                    // Channel no longer configured; drop the record.
                    selector::re_enable(channel_id);
                    continue;
                };
                match client.get(&channel.base_url).send().await {
                    Ok(response) if response.status().as_u16() < 500 => {
                        selector::re_enable(channel_id);
                    }
                    Ok(response) => logger::debug(
                        "probe",
                        &format!(
                            "channel {} still unhealthy: {}",
                            channel_id,
                            response.status()
                        ),
                    ),
                    Err(e) => logger::debug(
                        "probe",
                        &format!("channel {} still unreachable: {}", channel_id, e),
                    ),
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    logger::info("server", "shutdown signal received");
}

/// Full lifecycle: init, serve, drain, flush.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();
    store::init();
    config::ensure_admin_key();
    cache::refresh();
    cache::spawn_refresh_loop();
    consume::spawn_flush_loop();
    spawn_channel_probe();

    let cfg = config::load();
    let addr: SocketAddr = cfg.listen_addr.parse()?;
    logger::info("server", &format!("listening on {}", addr));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight requests got their grace period from axum's graceful
    // shutdown; now drain the write-behind buffer.
    let drained = consume::pipeline()
        .drain(
            &store::global(),
            Duration::from_secs(cfg.drain_timeout_secs),
        )
        .await;
    if !drained {
        logger::error("server", "consumption buffer did not drain before deadline");
    }
    logger::shutdown();
    Ok(())
}
