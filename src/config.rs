//! Configuration management
//!
//! Loads `config.yaml` from the working directory and deep-merges an
//! optional `data/.config.yaml` overlay on top (per-key recursive merge on
//! mappings, replace otherwise). Provider settings stay as raw YAML values;
//! each provider deserializes its own section on construction.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub selected_module: SelectedModule,
    #[serde(default = "default_mcp_endpoint")]
    pub mcp_endpoint: String,
    /// Provider settings, keyed by provider name within each family.
    #[serde(default, rename = "ASR")]
    pub asr: HashMap<String, serde_yaml::Value>,
    #[serde(default, rename = "LLM")]
    pub llm: HashMap<String, serde_yaml::Value>,
    #[serde(default, rename = "VLLM")]
    pub vllm: HashMap<String, serde_yaml::Value>,
    #[serde(default, rename = "TTS")]
    pub tts: HashMap<String, serde_yaml::Value>,
    #[serde(default, rename = "VAD")]
    pub vad: HashMap<String, serde_yaml::Value>,
    #[serde(default, rename = "Intent")]
    pub intent: HashMap<String, serde_yaml::Value>,
    #[serde(default, rename = "Memory")]
    pub memory: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_auth_key")]
    pub auth_key: String,
    #[serde(default)]
    pub vision_explain: String,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_http_port() -> u16 {
    8003
}

fn default_auth_key() -> String {
    "your-auth-key-change-this".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            http_port: default_http_port(),
            auth_key: default_auth_key(),
            vision_explain: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "tmp".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

/// Active provider selection, one name per family
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectedModule {
    #[serde(default, rename = "ASR")]
    pub asr: String,
    #[serde(default, rename = "LLM")]
    pub llm: String,
    #[serde(default, rename = "VLLM")]
    pub vllm: String,
    #[serde(default, rename = "TTS")]
    pub tts: String,
    #[serde(default, rename = "VAD")]
    pub vad: String,
    #[serde(default, rename = "Intent")]
    pub intent: String,
    #[serde(default, rename = "Memory")]
    pub memory: String,
}

fn default_mcp_endpoint() -> String {
    "ws://localhost:8000/mcp/".to_string()
}

impl Config {
    /// Load configuration from `config.yaml`, overlaying `data/.config.yaml`
    /// when present, and ensure the directories the server writes into exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yaml"))
    }

    /// Load configuration from an explicit path. The overlay path stays
    /// relative to the working directory, matching the deployment layout.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut root: serde_yaml::Value = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let overlay_path = Path::new("data/.config.yaml");
        if overlay_path.exists() {
            let overlay_contents = std::fs::read_to_string(overlay_path)
                .context("Failed to read config overlay")?;
            let overlay: serde_yaml::Value = serde_yaml::from_str(&overlay_contents)
                .context("Failed to parse config overlay")?;
            root = merge_values(root, overlay);
        }

        let config: Config =
            serde_yaml::from_value(root).context("Failed to deserialize configuration")?;
        config.ensure_directories()?;
        Ok(config)
    }

    /// Create the directories the gateway writes into. None of the files
    /// inside are required to exist at startup.
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs: Vec<PathBuf> = vec![
            PathBuf::from(&self.log.log_dir),
            PathBuf::from("data"),
            PathBuf::from("data/bin"),
        ];
        for family in [&self.asr, &self.tts] {
            for settings in family.values() {
                if let Some(dir) = settings.get("output_dir").and_then(|v| v.as_str()) {
                    dirs.push(PathBuf::from(dir));
                }
            }
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Settings of the active provider for a family, if one is selected
    /// and configured.
    pub fn active_provider<'a>(
        family: &'a HashMap<String, serde_yaml::Value>,
        selected: &str,
    ) -> Option<(&'a str, &'a serde_yaml::Value)> {
        if selected.is_empty() {
            return None;
        }
        family
            .get_key_value(selected)
            .map(|(name, value)| (name.as_str(), value))
    }
}

/// Recursive merge: mappings merge per key, everything else is replaced by
/// the overlay value.
fn merge_values(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}
