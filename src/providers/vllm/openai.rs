//! OpenAI-compatible vision driver (single-shot image analysis).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::VllmProvider;
use crate::error::GatewayError;

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiVisionConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_model() -> String {
    "qwen-vl-max".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1500
}

pub struct OpenAiVision {
    config: OpenAiVisionConfig,
    client: Client,
}

impl OpenAiVision {
    pub fn new(config: OpenAiVisionConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl VllmProvider for OpenAiVision {
    async fn analyze_image(&self, image_url: &str, prompt: &str) -> Result<String, GatewayError> {
        let body = json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": image_url}},
                ],
            }],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        info!("Analyzing image with model {}", self.config.model);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("vision request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamTransient(format!(
                "vision api error ({}): {}",
                status, body
            )));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamProtocol(format!("vision response: {}", e)))?;
        let content = parsed
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        Ok(content)
    }
}
