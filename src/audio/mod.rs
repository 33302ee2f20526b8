//! Audio plumbing: Opus frame decoding and voice-activity detection.

pub mod codec;
pub mod vad;

pub use codec::OpusFrameDecoder;
pub use vad::{VadEdge, VadEngine, VadModel, VadOutcome, VadTuning};
