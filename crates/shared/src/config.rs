//! Application configuration.
//!
//! Built-in defaults are kept as a JSON document and deep-merged with an
//! optional override file before being deserialized, so an override only
//! needs to carry the keys it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Environment variable naming an override file.
pub const CONFIG_ENV_VAR: &str = "CHATBOT_CONFIG";

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub endpoint: String,
    pub max_retries: u32,
    /// Initial backoff delay in seconds.
    pub retry_delay: f64,
    /// Base request timeout in seconds, grown on each retry.
    pub timeout: f64,
    /// Lower bound in seconds for the per-read timeout of streaming requests.
    pub stream_read_timeout: f64,
}

impl ApiConfig {
    pub fn retry_delay(&self) -> Duration {
        secs(self.retry_delay)
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }

    pub fn stream_read_timeout(&self) -> Duration {
        secs(self.stream_read_timeout)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Lower sorts first when the model list is used as a fallback registry.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub context_window: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    pub max_message_display: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub max_history_messages: usize,
    pub cooldown_seconds: f64,
    pub post_generate_cooldown_seconds: f64,
    pub generating_watchdog_timeout: f64,
    pub concise_by_default: bool,
}

impl ConversationConfig {
    pub fn cooldown(&self) -> Duration {
        secs(self.cooldown_seconds)
    }

    pub fn post_generate_cooldown(&self) -> Duration {
        secs(self.post_generate_cooldown_seconds)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        secs(self.generating_watchdog_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entry lifetime in seconds.
    pub ttl: u64,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub models: BTreeMap<String, ModelInfo>,
    pub ui: UiConfig,
    pub conversation: ConversationConfig,
    pub cache: CacheConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_value(default_config_value()).expect("built-in configuration is valid")
    }
}

impl AppConfig {
    /// Deep-merge `overrides` onto the built-in defaults and deserialize.
    pub fn with_overrides(overrides: Value) -> Result<Self> {
        let mut merged = default_config_value();
        deep_merge(&mut merged, overrides);
        Self::from_value(merged)
    }

    fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("invalid configuration")
    }

    /// Load defaults merged with the JSON file at `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let overrides: Value = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::with_overrides(overrides)
    }

    /// Load configuration, degrading to defaults when the override file is
    /// missing or broken.
    pub fn load(explicit: Option<&Path>) -> Self {
        let Some(path) = config_path(explicit) else {
            tracing::debug!("no configuration override found, using defaults");
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to load configuration: {e:#}, using defaults");
                Self::default()
            }
        }
    }

    /// Configured model ids ordered by priority, then id.
    pub fn ordered_model_ids(&self) -> Vec<String> {
        let mut ids: Vec<(&String, &ModelInfo)> = self.models.iter().collect();
        ids.sort_by(|(a_id, a), (b_id, b)| {
            let a_pri = a.priority.unwrap_or(i32::MAX);
            let b_pri = b.priority.unwrap_or(i32::MAX);
            a_pri.cmp(&b_pri).then_with(|| a_id.cmp(b_id))
        });
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

/// Resolve the override file: explicit path, `$CHATBOT_CONFIG`,
/// `./config.json`, then the per-user config directory.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }
    directories::ProjectDirs::from("com.local", "Local Chat", "LocalChat")
        .map(|proj| proj.config_dir().join(CONFIG_FILE_NAME))
        .filter(|p| p.is_file())
}

static GLOBAL: LazyLock<AppConfig> = LazyLock::new(|| AppConfig::load(None));

/// Process-wide configuration, loaded on first access.
pub fn global() -> &'static AppConfig {
    &GLOBAL
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = matches!(
                    (base_map.get(&key), &value),
                    (Some(Value::Object(_)), Value::Object(_))
                );
                match base_map.get_mut(&key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

pub fn default_config_value() -> Value {
    json!({
        "api": {
            "endpoint": "http://localhost:1314/api/chat",
            "max_retries": 3,
            "retry_delay": 1.0,
            "timeout": 30.0,
            "stream_read_timeout": 20.0
        },
        "models": {
            "qwen2.5:3b": {
                "display_name": "Qwen 2.5 3B",
                "description": "Lightweight model for everyday chat and simple questions",
                "max_tokens": 2048,
                "priority": 1
            },
            "deepseek-r1:8b": {
                "display_name": "DeepSeek R1 8B",
                "description": "Mid-size model with strong Chinese understanding",
                "max_tokens": 3072,
                "priority": 2
            },
            "llama3.1:latest": {
                "display_name": "Llama 3.1",
                "description": "Broad multilingual knowledge",
                "max_tokens": 4096,
                "priority": 3
            },
            "granite3.2-vision:latest": {
                "display_name": "Granite Vision 3.2",
                "description": "Vision model used for image and document understanding",
                "max_tokens": 4096,
                "priority": 4
            }
        },
        "ui": {
            "max_message_display": 50
        },
        "conversation": {
            "max_history_messages": 10,
            "cooldown_seconds": 1.0,
            "post_generate_cooldown_seconds": 2.0,
            "generating_watchdog_timeout": 5.0,
            "concise_by_default": true
        },
        "cache": {
            "enabled": true,
            "ttl": 3600,
            "max_entries": 100
        }
    })
}

/// Longest duration any setting can express, roughly 30 years.
const MAX_SETTING_SECS: f64 = 1e9;

fn secs(value: f64) -> Duration {
    if value > 0.0 {
        Duration::try_from_secs_f64(value.min(MAX_SETTING_SECS)).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}
