//! VAD model providers.

pub mod silero;

pub use silero::SileroModel;
