//! Voice-activity detection engine
//!
//! Consumes decoded PCM, evaluates the model over 512-sample (32 ms)
//! windows and debounces the per-window decision through a small hysteresis
//! queue. Two thresholds avoid flicker: probabilities between LOW and HIGH
//! inherit the previous window's decision. An utterance is in speech while
//! at least 3 of the last 5 windows were voiced; the stop edge additionally
//! requires a full silence interval since the last voiced window.

use std::collections::VecDeque;
use std::time::Instant;

use crate::error::GatewayError;

/// Samples per model window (32 ms at 16 kHz).
pub const WINDOW_SAMPLES: usize = 512;

const HYSTERESIS_LEN: usize = 3;
const WINDOW_CAPACITY: usize = 5;

/// Speech-probability model evaluated once per window.
pub trait VadModel: Send {
    fn predict(&mut self, window: &[f32]) -> Result<f32, GatewayError>;

    /// Clear recurrent state between utterances.
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct VadTuning {
    pub threshold: f32,
    pub threshold_low: f32,
    pub silence_ms: u64,
}

impl Default for VadTuning {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            threshold_low: 0.2,
            silence_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct VadOutcome {
    pub voiced: bool,
    pub edge: Option<VadEdge>,
}

pub struct VadEngine {
    model: Box<dyn VadModel>,
    tuning: VadTuning,
    pcm_buffer: Vec<i16>,
    hysteresis_window: VecDeque<bool>,
    last_frame_voiced: bool,
    in_speech: bool,
    last_voiced_at: Option<Instant>,
    stop_latched: bool,
}

impl VadEngine {
    pub fn new(model: Box<dyn VadModel>, tuning: VadTuning) -> Self {
        Self {
            model,
            tuning,
            pcm_buffer: Vec::new(),
            hysteresis_window: VecDeque::with_capacity(WINDOW_CAPACITY),
            last_frame_voiced: false,
            in_speech: false,
            last_voiced_at: None,
            stop_latched: false,
        }
    }

    /// Feed one decoded PCM frame. At most one edge is reported per call;
    /// a reported stop stays latched until `reset`.
    pub fn feed(&mut self, pcm: &[i16]) -> Result<VadOutcome, GatewayError> {
        self.pcm_buffer.extend_from_slice(pcm);

        let mut voiced = self.in_speech;
        let mut edge = None;

        while self.pcm_buffer.len() >= WINDOW_SAMPLES {
            let window: Vec<f32> = self
                .pcm_buffer
                .drain(..WINDOW_SAMPLES)
                .map(|s| s as f32 / 32768.0)
                .collect();
            let prob = self.model.predict(&window)?;

            let window_voiced = if prob >= self.tuning.threshold {
                true
            } else if prob <= self.tuning.threshold_low {
                false
            } else {
                self.last_frame_voiced
            };
            self.last_frame_voiced = window_voiced;

            if self.hysteresis_window.len() == WINDOW_CAPACITY {
                self.hysteresis_window.pop_front();
            }
            self.hysteresis_window.push_back(window_voiced);

            let in_speech_now =
                self.hysteresis_window.iter().filter(|v| **v).count() >= HYSTERESIS_LEN;
            voiced = in_speech_now;

            if in_speech_now {
                self.last_voiced_at = Some(Instant::now());
                if !self.in_speech {
                    self.in_speech = true;
                    edge = Some(VadEdge::Start);
                }
            } else if self.in_speech && !self.stop_latched {
                let silent_for = self
                    .last_voiced_at
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(u64::MAX);
                if silent_for >= self.tuning.silence_ms {
                    self.in_speech = false;
                    self.stop_latched = true;
                    edge = Some(VadEdge::Stop);
                }
            }
        }

        Ok(VadOutcome { voiced, edge })
    }

    /// Full reset: clears the stop latch, the hysteresis state, buffered
    /// PCM and the model's recurrent state. The orchestrator calls this
    /// after every stop edge and after aborted turns.
    pub fn reset(&mut self) {
        self.pcm_buffer.clear();
        self.hysteresis_window.clear();
        self.last_frame_voiced = false;
        self.in_speech = false;
        self.last_voiced_at = None;
        self.stop_latched = false;
        self.model.reset();
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }
}
