//! Streaming synthesis drivers.

pub mod volcano;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;

#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize one sentence; audio frames arrive in playback order and
    /// the channel closes when synthesis finishes. An upstream failure ends
    /// the stream with an `Err` item.
    async fn synthesize(&self, text: &str) -> mpsc::Receiver<Result<Vec<u8>, GatewayError>>;
}
