//! OpenAI-compatible streaming chat driver
//!
//! Posts to `{base_url}/chat/completions` with `stream=true` and parses
//! the SSE reply into token deltas.

use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ChatTurn, LlmProvider};
use crate::error::GatewayError;
use async_trait::async_trait;

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChatConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub enable_search: bool,
}

fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_model() -> String {
    "qwen-plus".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_top_p() -> f32 {
    0.8
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChat {
    config: OpenAiChatConfig,
    client: Client,
}

impl OpenAiChat {
    pub fn new(config: OpenAiChatConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn request_body(&self, text: &str, history: &[ChatTurn]) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = history
            .iter()
            .map(|turn| json!({"role": turn.role, "content": turn.content}))
            .collect();
        messages.push(json!({"role": "user", "content": text}));

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "top_p": self.config.top_p,
            "stream": true,
        });
        if self.config.enable_search {
            body["enable_search"] = json!(true);
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    async fn chat_stream(
        &self,
        text: &str,
        history: &[ChatTurn],
    ) -> mpsc::Receiver<Result<String, GatewayError>> {
        let (tx, rx) = mpsc::channel(32);
        let body = self.request_body(text, history);
        let url = format!("{}/chat/completions", self.config.base_url);
        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body);

        info!("Starting chat stream with model {}", self.config.model);
        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let _ = tx
                        .send(Err(GatewayError::UpstreamTransient(format!(
                            "llm request: {}",
                            e
                        ))))
                        .await;
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let _ = tx
                    .send(Err(GatewayError::UpstreamTransient(format!(
                        "llm api error ({}): {}",
                        status, body
                    ))))
                    .await;
                return;
            }

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GatewayError::UpstreamTransient(format!(
                                "llm stream: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by blank lines
                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);

                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            return;
                        }
                        match serde_json::from_str::<StreamResponse>(data) {
                            Ok(parsed) => {
                                let delta = parsed
                                    .choices
                                    .first()
                                    .and_then(|c| c.delta.content.clone());
                                if let Some(content) = delta {
                                    if !content.is_empty()
                                        && tx.send(Ok(content)).await.is_err()
                                    {
                                        return;
                                    }
                                }
                            }
                            Err(e) => debug!("Skipping unparseable SSE chunk: {}", e),
                        }
                    }
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let config: OpenAiChatConfig =
            serde_yaml::from_str("api_key: \"k\"\nenable_search: true\n").unwrap();
        let chat = OpenAiChat::new(config);
        let history = vec![
            ChatTurn::user("早上好"),
            ChatTurn::assistant("早上好！"),
        ];
        let body = chat.request_body("现在几点？", &history);
        assert_eq!(body["model"], "qwen-plus");
        assert_eq!(body["stream"], true);
        assert_eq!(body["enable_search"], true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"], "现在几点？");
    }

    #[test]
    fn test_enable_search_omitted_by_default() {
        let config: OpenAiChatConfig = serde_yaml::from_str("api_key: \"k\"\n").unwrap();
        let chat = OpenAiChat::new(config);
        let body = chat.request_body("hi", &[]);
        assert!(body.get("enable_search").is_none());
    }

    #[test]
    fn test_stream_response_parse() {
        let data = r#"{"choices":[{"delta":{"content":"你好"}}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        assert_eq!(
            parsed.choices[0].delta.content.as_deref(),
            Some("你好")
        );
    }
}
