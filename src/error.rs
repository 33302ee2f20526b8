//! Gateway error model
//!
//! Errors are classified by how the connection recovers from them: a
//! `Decode` drops one frame, the `Upstream*` kinds abort the current turn
//! while the connection survives, `ClientProtocol` closes the channel, and
//! `Config` is fatal at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Startup-fatal configuration problem.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed audio frame; the frame is dropped and the stream continues.
    #[error("decode error: {0}")]
    Decode(String),

    /// Upstream rejected our credentials (e.g. HTTP 403 on handshake).
    #[error("upstream auth error: {0}")]
    UpstreamAuth(String),

    /// Upstream sent something we cannot parse or a protocol-level failure.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Transient upstream failure (connect refused, stream reset, 5xx).
    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    /// The client violated the channel contract.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// Anything else; aborts the turn and gets logged.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether the connection should survive this error (per-turn recovery).
    pub fn is_turn_scoped(&self) -> bool {
        !matches!(self, GatewayError::Config(_) | GatewayError::ClientProtocol(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::UpstreamProtocol(format!("json: {}", e))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Internal(format!("io: {}", e))
    }
}
