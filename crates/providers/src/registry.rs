//! Which model ids the backend can serve, and how a requested id is mapped
//! onto one of them.

use crate::error::RequestError;
use crate::protocol::ApiFlavor;
use crate::transport::Transport;
use serde::Deserialize;
use shared::config::AppConfig;
use std::time::Duration;

/// Used when the backend cannot be reached at all.
pub const BUILT_IN_MODELS: &[&str] = &["qwen2.5:3b", "deepseek-r1:8b", "llama3.1:latest"];

pub const DEFAULT_MODELS_ENDPOINT: &str = "http://localhost:1314/api/tags";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySource {
    /// Listed by the backend itself.
    Probe,
    /// The `models` table of the configuration.
    Config,
    BuiltIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    models: Vec<String>,
    source: RegistrySource,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl ModelRegistry {
    /// Ids keep their order; duplicates are dropped.
    pub fn new(models: impl IntoIterator<Item = impl Into<String>>, source: RegistrySource) -> Self {
        let mut unique: Vec<String> = Vec::new();
        for id in models.into_iter().map(Into::into) {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        Self {
            models: unique,
            source,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::<String>::new(), RegistrySource::Config)
    }

    pub fn built_in() -> Self {
        Self::new(BUILT_IN_MODELS.iter().copied(), RegistrySource::BuiltIn)
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.ordered_model_ids(), RegistrySource::Config)
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.iter().any(|m| m == id)
    }

    pub fn source(&self) -> RegistrySource {
        self.source
    }

    /// Map `requested` onto a registered id: unchanged when registered (or
    /// when nothing is registered), else the first id of the same family
    /// (`qwen2.5:7b` → `qwen2.5:3b`), else the first id.
    pub fn resolve(&self, requested: &str) -> String {
        if self.is_empty() || self.contains(requested) {
            return requested.to_string();
        }

        let family = requested.split(':').next().unwrap_or(requested);
        if let Some(sibling) = self.models.iter().find(|m| m.starts_with(family)) {
            tracing::warn!(requested, substitute = %sibling, "model not available, using same family");
            return sibling.clone();
        }

        let first = &self.models[0];
        tracing::warn!(requested, substitute = %first, "model not available, using default");
        first.clone()
    }

    /// Build the registry for `endpoint`. Only Ollama-style backends are
    /// asked for their model list; everyone else gets the configured models.
    pub async fn probe(
        transport: &dyn Transport,
        endpoint: &str,
        flavor: ApiFlavor,
        config: &AppConfig,
    ) -> Self {
        if flavor != ApiFlavor::Ollama {
            return Self::from_config(config);
        }

        let url = models_endpoint(endpoint);
        let timeout = config.api.timeout();
        tracing::debug!(%url, "listing available models");

        let response = match transport.get(&url, timeout).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%url, "model listing unreachable ({}), using built-in list", e);
                return Self::built_in();
            }
        };

        if !response.is_success() {
            tracing::warn!(%url, status = response.status, "model listing failed, using configured models");
            return Self::from_config(config);
        }

        let read_timeout = if timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            timeout
        };
        let body = match response.read_to_end(read_timeout).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(%url, "model listing interrupted ({}), using built-in list", e);
                return Self::built_in();
            }
        };

        match parse_tags(&body) {
            Ok(ids) if !ids.is_empty() => {
                tracing::info!(count = ids.len(), "backend reported available models");
                Self::new(ids, RegistrySource::Probe)
            }
            Ok(_) => {
                tracing::warn!(%url, "backend reported no models, using configured models");
                Self::from_config(config)
            }
            Err(e) => {
                tracing::warn!(%url, "unreadable model listing ({}), using configured models", e);
                Self::from_config(config)
            }
        }
    }
}

fn parse_tags(body: &[u8]) -> Result<Vec<String>, RequestError> {
    let tags: TagsResponse = serde_json::from_slice(body)
        .map_err(|e| RequestError::Unknown(format!("invalid model listing: {}", e)))?;
    Ok(tags.models.into_iter().map(|t| t.name).collect())
}

/// `/api/chat` endpoints list their models at `/api/tags`.
pub fn models_endpoint(endpoint: &str) -> String {
    if endpoint.contains("/api/chat") {
        endpoint.replace("/api/chat", "/api/tags")
    } else {
        DEFAULT_MODELS_ENDPOINT.to_string()
    }
}
