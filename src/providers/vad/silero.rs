//! Silero VAD inference via ONNX Runtime
//!
//! One session per connection: the model carries a recurrent state tensor
//! across windows, so concurrent connections must not share an instance.

use ort::session::Session;
use serde::Deserialize;
use tracing::info;

use crate::audio::vad::VadModel;
use crate::error::GatewayError;

const SAMPLE_RATE: i64 = 16_000;
const STATE_LEN: usize = 2 * 1 * 128;

#[derive(Debug, Clone, Deserialize)]
pub struct SileroConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_threshold_low")]
    pub threshold_low: f32,
    #[serde(default = "default_silence_ms")]
    pub min_silence_duration_ms: u64,
}

fn default_model_path() -> String {
    "models/silero_vad.onnx".to_string()
}

fn default_threshold() -> f32 {
    0.5
}

fn default_threshold_low() -> f32 {
    0.2
}

fn default_silence_ms() -> u64 {
    1000
}

pub struct SileroModel {
    session: Session,
    /// Hidden state tensor (2, 1, 128), persists across windows.
    state: Vec<f32>,
}

impl SileroModel {
    pub fn new(config: &SileroConfig) -> Result<Self, GatewayError> {
        let session = Session::builder()
            .and_then(|b| Ok(b.with_intra_threads(1)?))
            .and_then(|mut b| b.commit_from_file(&config.model_path))
            .map_err(|e| {
                GatewayError::Config(format!(
                    "failed to load Silero VAD model from {}: {}",
                    config.model_path, e
                ))
            })?;
        info!("Silero VAD loaded from {}", config.model_path);
        Ok(Self {
            session,
            state: vec![0.0f32; STATE_LEN],
        })
    }

    fn run_inference(&mut self, window: &[f32]) -> Result<f32, GatewayError> {
        use ort::value::Value;

        let internal = |e: ort::Error| GatewayError::Internal(format!("vad inference: {}", e));

        let input = Value::from_array(([1usize, window.len()], window.to_vec()))
            .map_err(internal)?;
        let state = Value::from_array(([2usize, 1usize, 128usize], self.state.clone()))
            .map_err(internal)?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE])).map_err(internal)?;

        let outputs = self
            .session
            .run(ort::inputs![input, state, sr])
            .map_err(internal)?;

        let (_prob_shape, prob_data) =
            outputs[0].try_extract_tensor::<f32>().map_err(internal)?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        let (_state_shape, new_state) =
            outputs[1].try_extract_tensor::<f32>().map_err(internal)?;
        if new_state.len() == self.state.len() {
            self.state.copy_from_slice(new_state);
        }

        Ok(prob)
    }
}

impl VadModel for SileroModel {
    fn predict(&mut self, window: &[f32]) -> Result<f32, GatewayError> {
        self.run_inference(window)
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: SileroConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.threshold, 0.5);
        assert_eq!(config.threshold_low, 0.2);
        assert_eq!(config.min_silence_duration_ms, 1000);
        assert_eq!(config.model_path, "models/silero_vad.onnx");
    }

    #[test]
    fn test_missing_model_is_config_error() {
        let config = SileroConfig {
            model_path: "does/not/exist.onnx".to_string(),
            threshold: 0.5,
            threshold_low: 0.2,
            min_silence_duration_ms: 1000,
        };
        assert!(matches!(
            SileroModel::new(&config),
            Err(GatewayError::Config(_))
        ));
    }
}
