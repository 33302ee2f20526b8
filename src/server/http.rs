//! HTTP surface: health, OTA, vision stub, device inventory
//!
//! Served on `server.http_port`, separate from the media WebSocket. The
//! inventory endpoints read the shared connection registry; nothing here
//! touches the per-connection pipelines.

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::server::registry::ConnectionRegistry;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct HttpState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub started_at: Instant,
}

pub fn http_router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/xiaozhi/ota/", get(ota_get_handler).post(ota_post_handler))
        .route("/xiaozhi/vision/", post(vision_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/config", get(config_handler))
        .nest_service("/download", ServeDir::new("data/bin"))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Best-effort LAN address for advertised URLs.
pub fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

async fn ota_get_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let ip = local_ip();
    let port = state.config.server.port;
    let http_port = state.config.server.http_port;
    Json(json!({
        "version": VERSION,
        "websocketUrl": format!("ws://{}:{}", ip, port),
        "httpUrl": format!("http://{}:{}", ip, http_port),
        "firmwareUrl": format!("http://{}:{}/download/firmware.bin", ip, http_port),
        "description": "Voice dialog gateway",
    }))
}

async fn ota_post_handler(
    State(state): State<HttpState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let device_id = body
        .get("deviceId")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let current_version = body
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    info!("OTA request from device {}, version {}", device_id, current_version);

    let firmware = Path::new("data/bin/firmware.bin");
    let size = match std::fs::metadata(firmware) {
        Ok(metadata) => metadata.len(),
        Err(_) => {
            return Json(json!({
                "update": false,
                "message": "No firmware available",
            }));
        }
    };

    let ip = local_ip();
    let http_port = state.config.server.http_port;
    Json(json!({
        "update": true,
        "version": VERSION,
        "url": format!("http://{}:{}/download/firmware.bin", ip, http_port),
        "md5": "",
        "size": size,
    }))
}

async fn vision_handler() -> impl IntoResponse {
    // The upload contract is undefined; the VLLM provider is wired through
    // the factory but this surface stays a stub.
    Json(json!({
        "success": true,
        "message": "Vision analysis not yet implemented",
    }))
}

async fn devices_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let devices = state.registry.devices().await;
    Json(json!({
        "total": devices.len(),
        "devices": devices
            .iter()
            .map(|d| json!({
                "clientId": d.client_id,
                "macAddress": d.mac_address,
                "deviceModel": d.device_model,
                "connectedAt": d.connected_at.to_rfc3339(),
                "lastActivity": d.last_activity.to_rfc3339(),
            }))
            .collect::<Vec<_>>(),
    }))
}

async fn config_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let config = &state.config;
    Json(json!({
        "server": {
            "ip": config.server.ip,
            "port": config.server.port,
            "http_port": config.server.http_port,
        },
        "modules": {
            "ASR": config.selected_module.asr,
            "LLM": config.selected_module.llm,
            "TTS": config.selected_module.tts,
            "VAD": config.selected_module.vad,
            "VLLM": config.selected_module.vllm,
        },
    }))
}
