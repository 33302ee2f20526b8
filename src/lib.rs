//! Voxgate - Real-time voice dialog gateway
//!
//! A device streams Opus-encoded microphone audio over a WebSocket; the
//! gateway segments speech with a Silero VAD, drives a streaming
//! transcription upstream, pipes the transcript through a streaming chat
//! model and answers with synthesized audio, sentence by sentence:
//! - Frame codec + VAD with hysteresis and silence-based stop edges
//! - Provider-pluggable ASR/LLM/TTS/VLLM drivers picked from configuration
//! - Per-connection orchestrator with strict outbound framing order
//! - Device/session registry behind an HTTP inventory surface
//!
//! # Example
//!
//! ```ignore
//! use voxgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = std::sync::Arc::new(Config::load()?);
//!     voxgate::server::start(config).await
//! }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod providers;
pub mod server;
pub mod text;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::GatewayError;
pub use server::registry::ConnectionRegistry;
pub use text::SentenceSplitter;
