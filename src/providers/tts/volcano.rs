//! Volcano-style streaming TTS driver
//!
//! One upstream WebSocket per sentence: a single JSON submit request, then
//! the server alternates binary audio frames (forwarded verbatim) and JSON
//! status frames. A JSON frame with `operation == "finish"` ends the
//! stream; a nonzero `code` fails it.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::TtsProvider;
use crate::error::GatewayError;

#[derive(Debug, Clone, Deserialize)]
pub struct VolcanoTtsConfig {
    pub appid: String,
    pub access_token: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_speaker")]
    pub speaker: String,
    #[serde(default = "default_rate_ratio")]
    pub speech_rate: f32,
    #[serde(default = "default_rate_ratio")]
    pub loudness_rate: f32,
    #[serde(default = "default_rate_ratio")]
    pub pitch: f32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    #[serde(default)]
    pub output_dir: Option<String>,
}

fn default_cluster() -> String {
    "volcano_tts".to_string()
}

fn default_ws_url() -> String {
    "wss://openspeech.bytedance.com/api/v1/tts/ws_binary".to_string()
}

fn default_speaker() -> String {
    "zh_female_qingxin".to_string()
}

fn default_rate_ratio() -> f32 {
    1.0
}

fn default_sample_rate() -> u32 {
    24_000
}

fn default_audio_format() -> String {
    "pcm".to_string()
}

pub struct VolcanoTts {
    config: VolcanoTtsConfig,
}

impl VolcanoTts {
    pub fn new(config: VolcanoTtsConfig) -> Self {
        Self { config }
    }

    fn submit_request(&self, text: &str, reqid: &str) -> serde_json::Value {
        let cfg = &self.config;
        json!({
            "app": {
                "appid": cfg.appid,
                "token": cfg.access_token,
                "cluster": cfg.cluster,
            },
            "user": { "uid": "user_001" },
            "audio": {
                "voice_type": cfg.speaker,
                "encoding": cfg.audio_format,
                "speed_ratio": cfg.speech_rate,
                "volume_ratio": cfg.loudness_rate,
                "pitch_ratio": cfg.pitch,
                "rate": cfg.sample_rate,
            },
            "request": {
                "reqid": reqid,
                "text": text,
                "text_type": "plain",
                "operation": "submit",
            },
            "resource_id": cfg.resource_id,
        })
    }
}

#[async_trait]
impl TtsProvider for VolcanoTts {
    async fn synthesize(&self, text: &str) -> mpsc::Receiver<Result<Vec<u8>, GatewayError>> {
        let (tx, rx) = mpsc::channel(32);
        let reqid = uuid::Uuid::new_v4().to_string();
        let request = self.submit_request(text, &reqid);
        let ws_url = self.config.ws_url.clone();

        tokio::spawn(async move {
            use futures_util::SinkExt;

            let (mut ws, _) = match connect_async(&ws_url).await {
                Ok(ok) => ok,
                Err(e) => {
                    let _ = tx
                        .send(Err(GatewayError::UpstreamTransient(format!(
                            "tts connect: {}",
                            e
                        ))))
                        .await;
                    return;
                }
            };
            info!("TTS upstream connected, reqid {}", reqid);

            if let Err(e) = ws.send(Message::Text(request.to_string().into())).await {
                let _ = tx
                    .send(Err(GatewayError::UpstreamTransient(format!(
                        "tts submit: {}",
                        e
                    ))))
                    .await;
                return;
            }

            while let Some(message) = ws.next().await {
                match message {
                    Ok(Message::Binary(audio)) => {
                        if tx.send(Ok(audio.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        let status: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("Unparseable TTS status frame: {}", e);
                                continue;
                            }
                        };
                        let code = status.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                        if code != 0 {
                            let message = status
                                .get("message")
                                .and_then(|m| m.as_str())
                                .unwrap_or("unknown error");
                            let _ = tx
                                .send(Err(GatewayError::UpstreamProtocol(format!(
                                    "tts error {}: {}",
                                    code, message
                                ))))
                                .await;
                            break;
                        }
                        if status.get("operation").and_then(|o| o.as_str()) == Some("finish") {
                            debug!("TTS synthesis completed: {}", reqid);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx
                            .send(Err(GatewayError::UpstreamTransient(format!(
                                "tts stream: {}",
                                e
                            ))))
                            .await;
                        break;
                    }
                }
            }
        });

        rx
    }
}
