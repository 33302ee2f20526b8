//! Streaming transcription drivers
//!
//! An `AsrProvider` opens one upstream per utterance and hands back the
//! send half (`AsrStream`) plus an event channel fed by an internal
//! receiver task. Providers report every definite utterance as `Final`;
//! whether finals overwrite or accumulate is the orchestrator's call.

pub mod iflytek;
pub mod volcano;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// Transcription events emitted by the upstream receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum AsrEvent {
    /// Interim hypothesis; surfaced for debugging only.
    Partial(String),
    /// Definite utterance text.
    Final(String),
    /// The service reported no effective speech in the segment.
    Empty { duration_ms: u64 },
    /// Upstream error surfaced to the orchestrator.
    Error { code: u32, message: String },
    /// The upstream receiver finished (socket closed or end-of-stream).
    Closed,
}

/// Send half of an open transcription upstream.
#[async_trait]
pub trait AsrStream: Send {
    /// Forward one encoded client frame.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), GatewayError>;

    /// Signal logical end of utterance.
    async fn send_end(&mut self) -> Result<(), GatewayError>;

    /// Tear the upstream down. Idempotent.
    async fn close(&mut self);
}

/// An open upstream: send half plus the event stream.
pub struct AsrSession {
    pub stream: Box<dyn AsrStream>,
    pub events: mpsc::Receiver<AsrEvent>,
}

#[async_trait]
pub trait AsrProvider: Send + Sync {
    async fn open(&self, session_id: &str) -> Result<AsrSession, GatewayError>;
}
