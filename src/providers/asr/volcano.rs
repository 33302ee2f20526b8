//! Volcano-style streaming ASR driver (binary wire protocol)
//!
//! Wire format: 4-byte header, big-endian u32 payload length, gzip payload.
//! Header byte 0: protocol version (high nibble) | header size in 4-byte
//! units (low nibble). Byte 1: message kind (high) | flags (low; bit 0 =
//! sequence number present, bit 1 = last audio). Byte 2: serialization
//! (high, 1 = JSON) | compression (low, 1 = gzip). Byte 3: reserved.
//! The first client message is the JSON init payload; every later message
//! carries gzip-compressed PCM decoded from the client's Opus frames.

use std::io::{Read, Write};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{AsrEvent, AsrProvider, AsrSession, AsrStream};
use crate::audio::codec::{self, OpusFrameDecoder};
use crate::error::GatewayError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub const PROTOCOL_VERSION: u8 = 0x01;
pub const KIND_CLIENT_REQUEST: u8 = 0x01;
pub const KIND_AUDIO: u8 = 0x02;
pub const KIND_SERVER_RESPONSE: u8 = 0x09;
pub const KIND_SERVER_ERROR: u8 = 0x0f;
pub const FLAG_SEQUENCE: u8 = 0x01;
pub const FLAG_LAST_AUDIO: u8 = 0x02;
const SERIALIZATION_JSON: u8 = 0x01;
const COMPRESSION_GZIP: u8 = 0x01;

/// Code the upstream uses for "no effective speech"; never surfaced.
const CODE_NO_SPEECH: u32 = 1013;
const CODE_OK: u32 = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct VolcanoAsrConfig {
    pub appid: String,
    pub access_token: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    #[serde(default = "default_resource_id")]
    pub resource_id: String,
    #[serde(default = "default_stream_mode")]
    pub stream_mode: String,
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default = "default_workflow")]
    pub workflow: String,
    #[serde(default = "default_result_type")]
    pub result_type: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_format")]
    pub codec: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_bits")]
    pub bits: u32,
    #[serde(default = "default_channel")]
    pub channel: u32,
    #[serde(default)]
    pub boosting_table_name: String,
    #[serde(default)]
    pub correct_table_name: String,
    #[serde(default = "default_end_window_size")]
    pub end_window_size: u32,
    #[serde(default)]
    pub output_dir: Option<String>,
}

fn default_auth_method() -> String {
    "token".to_string()
}

fn default_resource_id() -> String {
    "volc.bigasr.sauc.duration".to_string()
}

fn default_stream_mode() -> String {
    "bigmodel_async".to_string()
}

fn default_uid() -> String {
    "streaming_asr_service".to_string()
}

fn default_workflow() -> String {
    "audio_in,resample,partition,vad,fe,decode,itn,nlu_punctuate".to_string()
}

fn default_result_type() -> String {
    "single".to_string()
}

fn default_format() -> String {
    "pcm".to_string()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_language() -> String {
    "zh-CN".to_string()
}

fn default_bits() -> u32 {
    16
}

fn default_channel() -> u32 {
    1
}

fn default_end_window_size() -> u32 {
    200
}

impl VolcanoAsrConfig {
    fn ws_url(&self) -> &'static str {
        match self.stream_mode.as_str() {
            "bigmodel" => "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel",
            "bigmodel_nostream" => "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel_nostream",
            _ => "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel_async",
        }
    }
}

// ─── Wire framing ────────────────────────────────────────────

fn gzip(data: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| GatewayError::UpstreamProtocol(format!("gzip: {}", e)))?;
    Ok(out)
}

fn build_header(kind: u8, flags: u8) -> [u8; 4] {
    [
        (PROTOCOL_VERSION << 4) | 0x01,
        (kind << 4) | flags,
        (SERIALIZATION_JSON << 4) | COMPRESSION_GZIP,
        0x00,
    ]
}

/// Header + BE length + gzip-compressed payload.
pub fn encode_frame(kind: u8, flags: u8, payload: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let compressed = gzip(payload)?;
    let mut frame = Vec::with_capacity(8 + compressed.len());
    frame.extend_from_slice(&build_header(kind, flags));
    frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

/// A parsed upstream frame.
#[derive(Debug, PartialEq)]
pub enum WireFrame {
    Json {
        kind: u8,
        flags: u8,
        payload: serde_json::Value,
    },
    Error {
        code: u32,
        payload: serde_json::Value,
    },
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, GatewayError> {
    let bytes: [u8; 4] = data
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| GatewayError::UpstreamProtocol("frame truncated".to_string()))?;
    Ok(u32::from_be_bytes(bytes))
}

pub fn parse_frame(data: &[u8]) -> Result<WireFrame, GatewayError> {
    if data.len() < 4 {
        return Err(GatewayError::UpstreamProtocol(format!(
            "frame too short: {} bytes",
            data.len()
        )));
    }
    let header_size = (data[0] & 0x0f) as usize * 4;
    let kind = (data[1] >> 4) & 0x0f;
    let flags = data[1] & 0x0f;
    let serialization = (data[2] >> 4) & 0x0f;
    let compression = data[2] & 0x0f;

    if kind == KIND_SERVER_ERROR {
        let code = read_u32(data, header_size)?;
        let msg_len = read_u32(data, header_size + 4)? as usize;
        let body = data
            .get(header_size + 8..header_size + 8 + msg_len)
            .ok_or_else(|| GatewayError::UpstreamProtocol("error frame truncated".to_string()))?;
        let payload = serde_json::from_slice(body)?;
        return Ok(WireFrame::Error { code, payload });
    }

    let mut offset = header_size;
    if flags & FLAG_SEQUENCE != 0 {
        offset += 4;
    }
    let payload_size = read_u32(data, offset)? as usize;
    offset += 4;
    let raw = data
        .get(offset..offset + payload_size)
        .ok_or_else(|| GatewayError::UpstreamProtocol("payload truncated".to_string()))?;

    let bytes = if compression == COMPRESSION_GZIP {
        gunzip(raw)?
    } else {
        raw.to_vec()
    };
    if serialization != SERIALIZATION_JSON {
        return Err(GatewayError::UpstreamProtocol(format!(
            "unsupported serialization: {}",
            serialization
        )));
    }
    let payload = serde_json::from_slice(&bytes)?;
    Ok(WireFrame::Json {
        kind,
        flags,
        payload,
    })
}

// ─── Driver ──────────────────────────────────────────────────

pub struct VolcanoAsr {
    config: VolcanoAsrConfig,
}

impl VolcanoAsr {
    pub fn new(config: VolcanoAsrConfig) -> Self {
        Self { config }
    }

    fn init_request(&self, reqid: &str) -> serde_json::Value {
        let cfg = &self.config;
        json!({
            "app": {
                "appid": cfg.appid,
                "cluster": cfg.cluster,
                "token": cfg.access_token,
            },
            "user": { "uid": cfg.uid },
            "request": {
                "reqid": reqid,
                "workflow": cfg.workflow,
                "show_utterances": true,
                "result_type": cfg.result_type,
                "sequence": 1,
                "boosting_table_name": cfg.boosting_table_name,
                "correct_table_name": cfg.correct_table_name,
                "end_window_size": cfg.end_window_size,
            },
            "audio": {
                "format": cfg.format,
                "codec": cfg.codec,
                "rate": cfg.sample_rate,
                "language": cfg.language,
                "bits": cfg.bits,
                "channel": cfg.channel,
                "sample_rate": cfg.sample_rate,
            },
        })
    }

    fn handshake_error(&self, err: impl std::fmt::Display) -> GatewayError {
        let message = err.to_string();
        if message.contains("403") || message.contains("rejected") {
            let token_prefix: String = self.config.access_token.chars().take(10).collect();
            error!(
                "ASR handshake rejected (HTTP 403): check app key {}, access key {}..., \
                 resource id {}, that the speech service is enabled for the account, and \
                 that the access token has not expired",
                self.config.appid, token_prefix, self.config.resource_id
            );
            GatewayError::UpstreamAuth(message)
        } else {
            GatewayError::UpstreamTransient(format!("ASR connect failed: {}", message))
        }
    }
}

#[async_trait]
impl AsrProvider for VolcanoAsr {
    async fn open(&self, session_id: &str) -> Result<AsrSession, GatewayError> {
        let mut request = self
            .config
            .ws_url()
            .into_client_request()
            .map_err(|e| GatewayError::Internal(format!("asr url: {}", e)))?;

        if self.config.auth_method == "token" {
            let connect_id = uuid::Uuid::new_v4().to_string();
            let headers = request.headers_mut();
            let value = |s: &str| {
                HeaderValue::from_str(s)
                    .map_err(|e| GatewayError::Config(format!("asr auth header: {}", e)))
            };
            headers.insert("X-Api-App-Key", value(&self.config.appid)?);
            headers.insert("X-Api-Access-Key", value(&self.config.access_token)?);
            headers.insert("X-Api-Resource-Id", value(&self.config.resource_id)?);
            headers.insert("X-Api-Connect-Id", value(&connect_id)?);
        }

        info!(
            "Opening ASR upstream [{}] for session {}",
            self.config.stream_mode, session_id
        );
        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| self.handshake_error(e))?;

        // Init handshake: JSON request out, one response back.
        let reqid = uuid::Uuid::new_v4().to_string();
        let init = self.init_request(&reqid);
        let frame = encode_frame(KIND_CLIENT_REQUEST, 0, init.to_string().as_bytes())?;
        ws.send(Message::Binary(frame.into()))
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("asr init send: {}", e)))?;

        let first = ws
            .next()
            .await
            .ok_or_else(|| {
                GatewayError::UpstreamTransient("asr closed during handshake".to_string())
            })?
            .map_err(|e| GatewayError::UpstreamTransient(format!("asr handshake: {}", e)))?;
        match &first {
            Message::Binary(data) => match parse_frame(data)? {
                WireFrame::Error { code, payload } if code != CODE_OK => {
                    return Err(GatewayError::UpstreamProtocol(format!(
                        "asr init failed: code {} ({})",
                        code, payload
                    )));
                }
                frame => debug!("ASR init response: {:?}", frame),
            },
            other => {
                return Err(GatewayError::UpstreamProtocol(format!(
                    "unexpected asr handshake message: {:?}",
                    other
                )));
            }
        }

        let (sink, source) = ws.split();
        let (events_tx, events_rx) = mpsc::channel(32);
        tokio::spawn(receive_results(source, events_tx));

        Ok(AsrSession {
            stream: Box::new(VolcanoStream {
                sink: Some(sink),
                decoder: OpusFrameDecoder::new()?,
            }),
            events: events_rx,
        })
    }
}

/// Receiver half: parses upstream frames into `AsrEvent`s until the socket
/// closes. Always finishes with `Closed`.
async fn receive_results(mut source: WsSource, events: mpsc::Sender<AsrEvent>) {
    while let Some(message) = source.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("ASR upstream read error: {}", e);
                break;
            }
        };

        let frame = match parse_frame(&data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unparseable ASR frame: {}", e);
                break;
            }
        };

        match frame {
            WireFrame::Error { code, payload } => {
                if code == CODE_NO_SPEECH {
                    // "no effective speech" is not an error
                    continue;
                }
                let message = payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                let _ = events.send(AsrEvent::Error { code, message }).await;
                break;
            }
            WireFrame::Json { payload, .. } => {
                if payload.get("code").and_then(|c| c.as_u64()) == Some(CODE_NO_SPEECH as u64) {
                    continue;
                }
                if !route_result(&payload, &events).await {
                    break;
                }
            }
        }
    }
    let _ = events.send(AsrEvent::Closed).await;
}

/// Route one response payload. Returns false when the receiver should stop.
async fn route_result(payload: &serde_json::Value, events: &mpsc::Sender<AsrEvent>) -> bool {
    let Some(result) = payload.get("result") else {
        return true;
    };
    let utterances = result
        .get("utterances")
        .and_then(|u| u.as_array())
        .cloned()
        .unwrap_or_default();
    let text = result.get("text").and_then(|t| t.as_str()).unwrap_or("");
    let duration_ms = payload
        .get("audio_info")
        .and_then(|a| a.get("duration"))
        .and_then(|d| d.as_u64())
        .unwrap_or(0);

    if utterances.is_empty() && text.is_empty() && duration_ms > 2000 {
        return events
            .send(AsrEvent::Empty { duration_ms })
            .await
            .is_ok();
    }

    for utterance in &utterances {
        let text = utterance
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        let definite = utterance
            .get("definite")
            .and_then(|d| d.as_bool())
            .unwrap_or(false);
        let event = if definite {
            AsrEvent::Final(text)
        } else {
            AsrEvent::Partial(text)
        };
        if events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

struct VolcanoStream {
    sink: Option<WsSink>,
    decoder: OpusFrameDecoder,
}

#[async_trait]
impl AsrStream for VolcanoStream {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), GatewayError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(GatewayError::Internal("asr stream already closed".to_string()));
        };
        let pcm = self.decoder.decode(frame)?;
        let message = encode_frame(KIND_AUDIO, 0, &codec::pcm_to_bytes(&pcm))?;
        sink.send(Message::Binary(message.into()))
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("asr send: {}", e)))
    }

    async fn send_end(&mut self) -> Result<(), GatewayError> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let message = encode_frame(KIND_AUDIO, FLAG_LAST_AUDIO, b"")?;
        sink.send(Message::Binary(message.into()))
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("asr send end: {}", e)))
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
    }
}
