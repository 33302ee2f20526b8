//! iFlytek-style streaming ASR driver (JSON wire protocol)
//!
//! Authenticates with `signa = base64(HMAC-SHA1(secret, app_id + ts))` as
//! query parameters, then exchanges JSON frames: `config` / `audio` (base64
//! payload) / `end` out, `result` / `error` / `end` back.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha1::Sha1;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{AsrEvent, AsrProvider, AsrSession, AsrStream};
use crate::error::GatewayError;

type HmacSha1 = Hmac<Sha1>;
type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, Deserialize)]
pub struct IflytekAsrConfig {
    pub app_id: String,
    pub access_key_secret: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_audio_encode")]
    pub audio_encode: String,
    #[serde(default = "default_samplerate")]
    pub samplerate: u32,
    #[serde(default)]
    pub role_type: u32,
    #[serde(default)]
    pub output_dir: Option<String>,
}

fn default_api_url() -> String {
    "wss://office-api-ast-dx.iflyaisol.com/ast/communicate/v1".to_string()
}

fn default_lang() -> String {
    "autodialect".to_string()
}

fn default_audio_encode() -> String {
    "pcm_s16le".to_string()
}

fn default_samplerate() -> u32 {
    16_000
}

pub struct IflytekAsr {
    config: IflytekAsrConfig,
}

impl IflytekAsr {
    pub fn new(config: IflytekAsrConfig) -> Self {
        Self { config }
    }

    fn signature(&self, timestamp: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha1::new_from_slice(self.config.access_key_secret.as_bytes())
            .map_err(|e| GatewayError::Config(format!("asr secret: {}", e)))?;
        mac.update(format!("{}{}", self.config.app_id, timestamp).as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn auth_url(&self) -> Result<String, GatewayError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signa = self.signature(&timestamp)?;
        let mut url = url::Url::parse(&self.config.api_url)
            .map_err(|e| GatewayError::Config(format!("asr url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("appid", &self.config.app_id)
            .append_pair("ts", &timestamp)
            .append_pair("signa", &signa);
        Ok(url.into())
    }
}

#[async_trait]
impl AsrProvider for IflytekAsr {
    async fn open(&self, session_id: &str) -> Result<AsrSession, GatewayError> {
        let url = self.auth_url()?;
        info!("Opening ASR upstream for session {}", session_id);
        let (mut ws, _) = connect_async(&url)
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("ASR connect failed: {}", e)))?;

        let config_msg = json!({
            "type": "config",
            "data": {
                "lang": self.config.lang,
                "audioEncode": self.config.audio_encode,
                "sampleRate": self.config.samplerate,
                "roleType": self.config.role_type,
            },
        });
        ws.send(Message::Text(config_msg.to_string().into()))
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("asr config send: {}", e)))?;

        let (sink, mut source) = ws.split();
        let (events, events_rx) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("ASR upstream read error: {}", e);
                        break;
                    }
                };
                let reply: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("Unparseable ASR reply: {}", e);
                        continue;
                    }
                };
                match reply.get("type").and_then(|t| t.as_str()) {
                    Some("result") => {
                        let text = reply
                            .get("data")
                            .and_then(|d| d.get("text"))
                            .and_then(|t| t.as_str())
                            .unwrap_or("");
                        if !text.is_empty()
                            && events
                                .send(AsrEvent::Final(text.to_string()))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Some("error") => {
                        let message = reply
                            .get("data")
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "unknown error".to_string());
                        let _ = events.send(AsrEvent::Error { code: 0, message }).await;
                        break;
                    }
                    Some("end") => break,
                    _ => {}
                }
            }
            let _ = events.send(AsrEvent::Closed).await;
        });

        Ok(AsrSession {
            stream: Box::new(IflytekStream { sink: Some(sink) }),
            events: events_rx,
        })
    }
}

struct IflytekStream {
    sink: Option<WsSink>,
}

#[async_trait]
impl AsrStream for IflytekStream {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), GatewayError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(GatewayError::Internal("asr stream already closed".to_string()));
        };
        let message = json!({
            "type": "audio",
            "data": BASE64.encode(frame),
        });
        sink.send(Message::Text(message.to_string().into()))
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("asr send: {}", e)))
    }

    async fn send_end(&mut self) -> Result<(), GatewayError> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        sink.send(Message::Text(json!({"type": "end"}).to_string().into()))
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("asr send end: {}", e)))
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IflytekAsrConfig {
        serde_yaml::from_str(concat!(
            "app_id: \"abc123\"\n",
            "access_key_secret: \"topsecret\"\n",
        ))
        .unwrap()
    }

    #[test]
    fn test_signature_is_stable_base64() {
        let asr = IflytekAsr::new(config());
        let first = asr.signature("1700000000").unwrap();
        let second = asr.signature("1700000000").unwrap();
        assert_eq!(first, second);
        assert!(BASE64.decode(&first).is_ok());
        // HMAC-SHA1 digests are 20 bytes
        assert_eq!(BASE64.decode(&first).unwrap().len(), 20);
    }

    #[test]
    fn test_auth_url_carries_query_params() {
        let asr = IflytekAsr::new(config());
        let url = asr.auth_url().unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        assert_eq!(params.get("appid").map(|v| v.as_ref()), Some("abc123"));
        assert!(params.contains_key("ts"));
        assert!(params.contains_key("signa"));
    }
}
