//! Streaming chat-completion drivers.

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// One entry of the bounded dialog history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream the model's reply to `text` given the (already trimmed)
    /// dialog history. Token deltas arrive in generation order; an upstream
    /// failure ends the stream with an `Err` item.
    async fn chat_stream(
        &self,
        text: &str,
        history: &[ChatTurn],
    ) -> mpsc::Receiver<Result<String, GatewayError>>;
}
