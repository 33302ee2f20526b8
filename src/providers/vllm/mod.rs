//! Vision-language drivers.

pub mod openai;

use async_trait::async_trait;

use crate::error::GatewayError;

#[async_trait]
pub trait VllmProvider: Send + Sync {
    /// Analyze an image (URL or data URI) with a text prompt.
    async fn analyze_image(&self, image_url: &str, prompt: &str) -> Result<String, GatewayError>;
}
