//! Provider capability traits and factories
//!
//! Each family (VAD/ASR/LLM/TTS/VLLM) is a capability trait; the factory
//! maps `selected_module.<FAMILY>` through the family's configuration map
//! to a constructor. Provider names are matched by prefix so deployment
//! variants like `doubao_stream` or `xunfei_stream` resolve without extra
//! wiring.

pub mod asr;
pub mod llm;
pub mod tts;
pub mod vad;
pub mod vllm;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::audio::vad::{VadEngine, VadTuning};
use crate::config::Config;
use crate::error::GatewayError;

use asr::iflytek::{IflytekAsr, IflytekAsrConfig};
use asr::volcano::{VolcanoAsr, VolcanoAsrConfig};
use asr::AsrProvider;
use llm::openai::{OpenAiChat, OpenAiChatConfig};
use llm::LlmProvider;
use tts::volcano::{VolcanoTts, VolcanoTtsConfig};
use tts::TtsProvider;
use vad::silero::{SileroConfig, SileroModel};
use vllm::openai::{OpenAiVision, OpenAiVisionConfig};
use vllm::VllmProvider;

pub struct ProviderFactory {
    config: Arc<Config>,
}

impl ProviderFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Build a fresh VAD engine (model + state machine) for one connection.
    pub fn build_vad(&self) -> Result<VadEngine, GatewayError> {
        let (name, settings) = self.active("VAD")?;
        if !name.starts_with("silero") {
            return Err(unknown_provider("VAD", name));
        }
        let config: SileroConfig = parse_settings(name, settings)?;
        let tuning = VadTuning {
            threshold: config.threshold,
            threshold_low: config.threshold_low,
            silence_ms: config.min_silence_duration_ms,
        };
        let model = SileroModel::new(&config)?;
        Ok(VadEngine::new(Box::new(model), tuning))
    }

    pub fn build_asr(&self) -> Result<Arc<dyn AsrProvider>, GatewayError> {
        let (name, settings) = self.active("ASR")?;
        if name.starts_with("volcano") || name.starts_with("doubao") {
            let config: VolcanoAsrConfig = parse_settings(name, settings)?;
            Ok(Arc::new(VolcanoAsr::new(config)))
        } else if name.starts_with("xunfei") || name.starts_with("iflytek") {
            let config: IflytekAsrConfig = parse_settings(name, settings)?;
            Ok(Arc::new(IflytekAsr::new(config)))
        } else {
            Err(unknown_provider("ASR", name))
        }
    }

    pub fn build_llm(&self) -> Result<Arc<dyn LlmProvider>, GatewayError> {
        let (name, settings) = self.active("LLM")?;
        if name.starts_with("qwen") || name.starts_with("openai") {
            let config: OpenAiChatConfig = parse_settings(name, settings)?;
            Ok(Arc::new(OpenAiChat::new(config)))
        } else {
            Err(unknown_provider("LLM", name))
        }
    }

    pub fn build_tts(&self) -> Result<Arc<dyn TtsProvider>, GatewayError> {
        let (name, settings) = self.active("TTS")?;
        if name.starts_with("huoshan") || name.starts_with("volcano") {
            let config: VolcanoTtsConfig = parse_settings(name, settings)?;
            Ok(Arc::new(VolcanoTts::new(config)))
        } else {
            Err(unknown_provider("TTS", name))
        }
    }

    pub fn build_vllm(&self) -> Result<Arc<dyn VllmProvider>, GatewayError> {
        let (name, settings) = self.active("VLLM")?;
        if name.starts_with("qwen") || name.starts_with("openai") {
            let config: OpenAiVisionConfig = parse_settings(name, settings)?;
            Ok(Arc::new(OpenAiVision::new(config)))
        } else {
            Err(unknown_provider("VLLM", name))
        }
    }

    fn active(&self, family: &str) -> Result<(&str, &serde_yaml::Value), GatewayError> {
        let config = &self.config;
        let (selected, map) = match family {
            "VAD" => (&config.selected_module.vad, &config.vad),
            "ASR" => (&config.selected_module.asr, &config.asr),
            "LLM" => (&config.selected_module.llm, &config.llm),
            "TTS" => (&config.selected_module.tts, &config.tts),
            "VLLM" => (&config.selected_module.vllm, &config.vllm),
            other => return Err(GatewayError::Config(format!("unknown family: {}", other))),
        };
        Config::active_provider(map, selected).ok_or_else(|| {
            GatewayError::Config(format!(
                "{} provider not configured (selected: {:?})",
                family, selected
            ))
        })
    }
}

fn parse_settings<T: DeserializeOwned>(
    name: &str,
    settings: &serde_yaml::Value,
) -> Result<T, GatewayError> {
    serde_yaml::from_value(settings.clone())
        .map_err(|e| GatewayError::Config(format!("invalid settings for {}: {}", name, e)))
}

fn unknown_provider(family: &str, name: &str) -> GatewayError {
    GatewayError::Config(format!("unknown {} provider: {}", family, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(yaml: &str) -> Arc<Config> {
        Arc::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn test_factory_resolves_selected_asr() {
        let config = config_with(concat!(
            "selected_module:\n  ASR: doubao_stream\n",
            "ASR:\n  doubao_stream:\n    appid: \"a\"\n    access_token: \"t\"\n",
        ));
        let factory = ProviderFactory::new(config);
        assert!(factory.build_asr().is_ok());
    }

    #[test]
    fn test_factory_rejects_unselected_family() {
        let factory = ProviderFactory::new(config_with("{}"));
        assert!(matches!(
            factory.build_llm(),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_factory_rejects_unknown_provider_name() {
        let config = config_with(concat!(
            "selected_module:\n  TTS: espeak\n",
            "TTS:\n  espeak:\n    voice: en\n",
        ));
        let factory = ProviderFactory::new(config);
        assert!(matches!(
            factory.build_tts(),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_factory_resolves_vllm() {
        let config = config_with(concat!(
            "selected_module:\n  VLLM: qwen_vl\n",
            "VLLM:\n  qwen_vl:\n    api_key: \"k\"\n",
        ));
        let factory = ProviderFactory::new(config);
        assert!(factory.build_vllm().is_ok());
    }

    #[test]
    fn test_factory_vad_requires_model_file() {
        let config = config_with(concat!(
            "selected_module:\n  VAD: silero\n",
            "VAD:\n  silero:\n    model_path: does/not/exist.onnx\n",
        ));
        let factory = ProviderFactory::new(config);
        assert!(matches!(
            factory.build_vad(),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_factory_rejects_bad_settings() {
        let config = config_with(concat!(
            "selected_module:\n  LLM: qwen_flash\n",
            "LLM:\n  qwen_flash:\n    model: qwen-plus\n", // api_key missing
        ));
        let factory = ProviderFactory::new(config);
        assert!(matches!(
            factory.build_llm(),
            Err(GatewayError::Config(_))
        ));
    }
}
