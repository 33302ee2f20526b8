//! Client-facing servers
//!
//! Two listeners: the media WebSocket on `server.port` and the HTTP
//! surface (health, OTA, inventory) on `server.http_port`. Every accepted
//! WebSocket must carry a `device-id` header or query parameter; without it
//! the client gets an error message and close code 1008.

pub mod connection;
pub mod http;
pub mod registry;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::providers::ProviderFactory;
use crate::server::connection::{ErrorData, ServerMessage};
use crate::server::http::{http_router, local_ip, HttpState};
use crate::server::registry::ConnectionRegistry;

/// Policy-violation close code used when the handshake lacks a device id.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub factory: Arc<ProviderFactory>,
    pub registry: Arc<ConnectionRegistry>,
}

impl ServerState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            factory: Arc::new(ProviderFactory::new(config.clone())),
            registry: ConnectionRegistry::new(),
            config,
        }
    }
}

pub fn ws_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start both listeners and run until shutdown.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let state = ServerState::new(config.clone());

    let ws_addr: SocketAddr = format!("{}:{}", config.server.ip, config.server.port)
        .parse()
        .context("Invalid WebSocket listen address")?;
    let http_addr: SocketAddr = format!("{}:{}", config.server.ip, config.server.http_port)
        .parse()
        .context("Invalid HTTP listen address")?;

    let http_state = HttpState {
        config: config.clone(),
        registry: state.registry.clone(),
        started_at: Instant::now(),
    };

    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("Failed to bind WebSocket listener on {}", ws_addr))?;
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;

    let ip = local_ip();
    info!("Server started:");
    info!("  WebSocket: ws://{}:{}/", ip, config.server.port);
    info!("  HTTP API:  http://{}:{}/", ip, config.server.http_port);
    info!("  Health:    http://{}:{}/health", ip, config.server.http_port);

    let http_app = http_router(http_state);
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, http_app).await {
            error!("HTTP server failed: {}", e);
        }
    });

    axum::serve(ws_listener, ws_router(state))
        .await
        .context("WebSocket server failed")?;
    http_task.abort();
    Ok(())
}

/// Resolve an identity from headers first, then query parameters.
fn identity(headers: &HeaderMap, params: &HashMap<String, String>, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .or_else(|| params.get(key).cloned())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let device_id = identity(&headers, &params, "device-id");
    let client_id = identity(&headers, &params, "client-id")
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    info!(
        "New connection: client_id={}, device_id={:?}",
        client_id, device_id
    );

    ws.on_upgrade(move |socket| async move {
        let Some(device_id) = device_id else {
            reject_missing_device_id(socket).await;
            return;
        };
        connection::handle_socket(
            socket,
            client_id,
            device_id,
            state.factory.clone(),
            state.registry.clone(),
        )
        .await;
    })
}

/// Accept, report the missing parameter, then close with 1008.
async fn reject_missing_device_id(mut socket: WebSocket) {
    let message = ServerMessage::Error {
        data: ErrorData {
            error: "缺少 device-id 参数".to_string(),
        },
    };
    let _ = socket
        .send(Message::Text(
            serde_json::to_string(&message).unwrap_or_default().into(),
        ))
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "Missing device-id".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_prefers_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("device-id", "from-header".parse().unwrap());
        let mut params = HashMap::new();
        params.insert("device-id".to_string(), "from-query".to_string());
        assert_eq!(
            identity(&headers, &params, "device-id").as_deref(),
            Some("from-header")
        );

        let empty = HeaderMap::new();
        assert_eq!(
            identity(&empty, &params, "device-id").as_deref(),
            Some("from-query")
        );
        assert!(identity(&empty, &HashMap::new(), "device-id").is_none());
    }
}
