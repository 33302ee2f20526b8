//! End-to-end tests for the client-facing surfaces: WebSocket handshake
//! rules, the control channel, and the HTTP inventory endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tower::util::ServiceExt;

use voxgate::config::Config;
use voxgate::server::http::{http_router, HttpState};
use voxgate::server::{ws_router, ServerState};

async fn spawn_ws_server() -> (SocketAddr, ServerState) {
    let state = ServerState::new(Arc::new(Config::default()));
    let router = ws_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

async fn next_json(
    ws: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Value {
    loop {
        match ws.next().await.expect("stream ended").expect("ws error") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_missing_device_id_rejected_with_1008() {
    let (addr, _) = spawn_ws_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["error"], "缺少 device-id 参数");

    match ws.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1008);
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_hello_on_accept_with_device_id_header() {
    let (addr, _) = spawn_ws_server().await;
    let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("device-id", HeaderValue::from_static("dev-42"));
    let (mut ws, _) = connect_async(request).await.unwrap();

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["status"], "connected");
    assert!(!hello["session_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_device_id_accepted_via_query_param() {
    let (addr, _) = spawn_ws_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/?device-id=dev-77", addr))
        .await
        .unwrap();
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
}

#[tokio::test]
async fn test_ping_pong_round_trip() {
    let (addr, _) = spawn_ws_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/?device-id=dev-1", addr))
        .await
        .unwrap();
    let _hello = next_json(&mut ws).await;

    ws.send(Message::Text(
        json!({"type": "control", "data": {"command": "ping"}})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "control");
    assert_eq!(pong["data"]["command"], "pong");
}

#[tokio::test]
async fn test_config_message_updates_registry() {
    let (addr, state) = spawn_ws_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/?device-id=dev-1&client-id=c-9", addr))
        .await
        .unwrap();
    let _hello = next_json(&mut ws).await;

    ws.send(Message::Text(
        json!({
            "type": "config",
            "deviceInfo": {"macAddress": "aa:bb:cc", "deviceModel": "esp32"},
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    // ping round-trip guarantees the config message was processed
    ws.send(Message::Text(
        json!({"type": "control", "data": {"command": "ping"}})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let _pong = next_json(&mut ws).await;

    let devices = state.registry.devices().await;
    let device = devices.iter().find(|d| d.client_id == "c-9").unwrap();
    assert_eq!(device.mac_address.as_deref(), Some("aa:bb:cc"));
    assert_eq!(device.device_model.as_deref(), Some("esp32"));
}

#[tokio::test]
async fn test_text_turn_without_llm_reports_error() {
    // No providers configured: a text turn must fail the turn, not the
    // connection.
    let (addr, _) = spawn_ws_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/?device-id=dev-1", addr))
        .await
        .unwrap();
    let _hello = next_json(&mut ws).await;

    ws.send(Message::Text(
        json!({"type": "text", "text": "你好"}).to_string().into(),
    ))
    .await
    .unwrap();

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");

    // the connection survives the failed turn
    ws.send(Message::Text(
        json!({"type": "control", "data": {"command": "ping"}})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["data"]["command"], "pong");
}

// ─── HTTP surface ────────────────────────────────────────────

fn http_state() -> HttpState {
    HttpState {
        config: Arc::new(Config::default()),
        registry: voxgate::ConnectionRegistry::new(),
        started_at: Instant::now(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = http_router(http_state());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_devices_endpoint_reflects_registry() {
    let state = http_state();
    state.registry.add_device("c-1").await;
    state
        .registry
        .update_device_info("c-1", Some("aa:bb".to_string()), None)
        .await;

    let app = http_router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/devices")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["devices"][0]["macAddress"], "aa:bb");
}

#[tokio::test]
async fn test_ota_get_advertises_endpoints() {
    let app = http_router(http_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/xiaozhi/ota/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["websocketUrl"].as_str().unwrap().starts_with("ws://"));
    assert!(body["firmwareUrl"]
        .as_str()
        .unwrap()
        .ends_with("/download/firmware.bin"));
}

#[tokio::test]
async fn test_vision_endpoint_is_stubbed() {
    let app = http_router(http_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/xiaozhi/vision/")
                .header("content-type", "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
}
