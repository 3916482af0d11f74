use anyhow::Context;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use courier_channels::{
    AdapterHandle, AdapterRegistry, ConnectionListener, MessageListener, NormalizedMessage,
    RegistryStats, SendRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{self, ConnectionEntry, CourierConfig};

pub async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::resolve_path(config_path);
    let config = config::load(&path)?;
    let registry = Arc::new(AdapterRegistry::new());

    let mut webchat_routers = Vec::new();
    for entry in config.enabled_connections() {
        match build_and_start(&registry, entry).await {
            Ok(Some(router)) => {
                webchat_routers.push((entry.descriptor.id, router));
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    connection_id = entry.descriptor.id,
                    name = %entry.descriptor.name,
                    %error,
                    "skipping connection"
                );
            }
        }
    }

    let mut app = Router::new()
        .route("/api/stats", get(stats))
        .route("/api/webhooks/cloud/{id}", post(cloud_webhook))
        .route("/api/webhooks/facebook/{id}", post(facebook_webhook))
        .route("/api/webhooks/instagram/{id}", post(instagram_webhook))
        .with_state(registry.clone());
    for (connection_id, router) in webchat_routers {
        app = app.nest(&format!("/api/channels/{connection_id}"), router);
    }
    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "courier gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Create and initialize one adapter; returns the web-chat router for
/// mounting when the connection is a widget.
async fn build_and_start(
    registry: &Arc<AdapterRegistry>,
    entry: &ConnectionEntry,
) -> anyhow::Result<Option<Router>> {
    let handle = registry.create_adapter(&entry.descriptor)?;
    attach_log_listeners(&handle).await;

    if let Err(error) = handle.adapter().initialize().await {
        tracing::warn!(
            connection_id = entry.descriptor.id,
            name = %entry.descriptor.name,
            code = error.code(),
            %error,
            "adapter failed to initialize; it stays registered for retry via reconnect"
        );
    }

    match &handle {
        AdapterHandle::WebChat(webchat) => Ok(Some(webchat.clone().router())),
        _ => Ok(None),
    }
}

async fn attach_log_listeners(handle: &AdapterHandle) {
    let adapter = handle.adapter();
    let connection_id = adapter.connection_id();

    let on_message: MessageListener = Arc::new(move |message: NormalizedMessage| {
        Box::pin(async move {
            tracing::info!(
                id = %message.id,
                channel = %message.channel,
                from = %message.from,
                from_me = message.from_me,
                "message"
            );
            Ok(())
        })
    });
    adapter.on_message(on_message).await;

    let on_status: ConnectionListener = Arc::new(move |status| {
        Box::pin(async move {
            tracing::info!(connection_id, ?status, "connection status changed");
            Ok(())
        })
    });
    adapter.on_connection_update(on_status).await;
}

async fn stats(State(registry): State<Arc<AdapterRegistry>>) -> Json<RegistryStats> {
    Json(registry.stats())
}

async fn cloud_webhook(
    State(registry): State<Arc<AdapterRegistry>>,
    Path(id): Path<i64>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    match registry.get(id) {
        Some(AdapterHandle::Cloud(adapter)) => {
            let accepted = adapter.process_webhook_event(&payload).len();
            Json(serde_json::json!({ "status": "ok", "accepted": accepted })).into_response()
        }
        Some(_) => wrong_channel("cloud"),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn facebook_webhook(
    State(registry): State<Arc<AdapterRegistry>>,
    Path(id): Path<i64>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    match registry.get(id) {
        Some(AdapterHandle::Facebook(adapter)) => {
            let accepted = messaging_events(&payload)
                .filter(|event| adapter.process_incoming_message(event).is_some())
                .count();
            Json(serde_json::json!({ "status": "ok", "accepted": accepted })).into_response()
        }
        Some(_) => wrong_channel("facebook"),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn instagram_webhook(
    State(registry): State<Arc<AdapterRegistry>>,
    Path(id): Path<i64>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    match registry.get(id) {
        Some(AdapterHandle::Instagram(adapter)) => {
            let accepted = messaging_events(&payload)
                .filter(|event| adapter.process_incoming_message(event).is_some())
                .count();
            Json(serde_json::json!({ "status": "ok", "accepted": accepted })).into_response()
        }
        Some(_) => wrong_channel("instagram"),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Flatten a graph webhook envelope (`entry[].messaging[]`) into its
/// individual messaging events.
fn messaging_events(payload: &serde_json::Value) -> impl Iterator<Item = &serde_json::Value> {
    payload
        .get("entry")
        .and_then(|entry| entry.as_array())
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("messaging").and_then(|m| m.as_array()))
        .flatten()
}

fn wrong_channel(expected: &str) -> axum::response::Response {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({
            "status": "error",
            "error": format!("connection is not a {expected} channel"),
        })),
    )
        .into_response()
}

pub async fn doctor(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::resolve_path(config_path);
    let config: CourierConfig = config::load(&path)?;
    println!("courier doctor: {} connection(s) configured", config.connections.len());

    let registry = AdapterRegistry::new();
    let mut failures = 0usize;
    for entry in &config.connections {
        let label = format!(
            "#{} {} ({})",
            entry.descriptor.id, entry.descriptor.name, entry.descriptor.channel
        );
        if !entry.enabled {
            println!("  skip {label}: disabled");
            continue;
        }
        match registry.create_adapter(&entry.descriptor) {
            Ok(_) => println!("  ok   {label}"),
            Err(error) => {
                failures += 1;
                println!("  FAIL {label}: {error} [{}]", error.code());
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} connection(s) failed validation");
    }
    println!("all enabled connections validate");
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    connection: i64,
    recipient: &str,
    message: &str,
) -> anyhow::Result<()> {
    let path = config::resolve_path(config_path);
    let config = config::load(&path)?;
    let entry = config
        .connections
        .iter()
        .find(|entry| entry.descriptor.id == connection)
        .with_context(|| format!("connection {connection} is not configured"))?;

    let registry = AdapterRegistry::new();
    let handle = registry.create_adapter(&entry.descriptor)?;
    let adapter = handle.adapter();
    adapter.initialize().await?;

    let sent = adapter
        .send_message(SendRequest::text(recipient, message))
        .await?;
    println!(
        "sent {} via {} at {}",
        sent.id, sent.channel, sent.timestamp_millis
    );
    Ok(())
}
