//! Wire shapes for the backends we know how to talk to.
//!
//! Requests are shaped per flavor. Responses are parsed with an ordered list
//! of JSON pointers: the flavor's own paths first, then a flavor-agnostic
//! chain, so an unexpected schema degrades to an empty string instead of an
//! error.

use crate::GenerationRequest;
use serde_json::{json, Value};
use std::fmt;

pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

/// Backend wire-protocol family, detected from the endpoint URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFlavor {
    /// Ollama chat API: sampling options nested under `options`.
    Ollama,
    /// OpenAI chat completions: flat body, bearer auth.
    OpenAi,
    /// Anything else. OpenAI-shaped body without auth.
    Generic,
}

/// Matching on the Ollama port and API paths as well as the name means the
/// default `localhost:1314/api/chat` endpoint is treated as Ollama, with
/// nested options and a model listing probe, not as a generic backend.
const OLLAMA_MARKERS: &[&str] = &["ollama", ":11434", "/api/chat", "/api/generate"];
const OPENAI_MARKERS: &[&str] = &["openai.com"];

impl ApiFlavor {
    pub fn detect(endpoint: &str) -> Self {
        let endpoint = endpoint.to_ascii_lowercase();
        if OPENAI_MARKERS.iter().any(|m| endpoint.contains(m)) {
            ApiFlavor::OpenAi
        } else if OLLAMA_MARKERS.iter().any(|m| endpoint.contains(m)) {
            ApiFlavor::Ollama
        } else {
            ApiFlavor::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFlavor::Ollama => "ollama",
            ApiFlavor::OpenAi => "openai",
            ApiFlavor::Generic => "generic",
        }
    }

    fn full_content_paths(self) -> &'static [&'static str] {
        match self {
            ApiFlavor::Ollama => &["/message/content"],
            ApiFlavor::OpenAi => &["/choices/0/message/content"],
            ApiFlavor::Generic => &[],
        }
    }

    fn stream_fragment_paths(self) -> &'static [&'static str] {
        match self {
            ApiFlavor::Ollama => &["/message/content", "/response"],
            ApiFlavor::OpenAi => &["/choices/0/delta/content"],
            ApiFlavor::Generic => &[],
        }
    }
}

impl fmt::Display for ApiFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tried after the flavor's own paths when parsing a complete response.
pub const FULL_CONTENT_CHAIN: &[&str] = &[
    "/content",
    "/message/content",
    "/choices/0/message/content",
    "/choices/0/text",
];

/// Tried after the flavor's own paths when parsing one stream chunk.
pub const STREAM_FRAGMENT_CHAIN: &[&str] = &[
    "/content",
    "/message/content",
    "/choices/0/delta/content",
    "/choices/0/text",
    "/response",
];

pub fn build_request(request: &GenerationRequest<'_>, flavor: ApiFlavor) -> Value {
    match flavor {
        ApiFlavor::Ollama => json!({
            "model": request.model,
            "messages": request.messages,
            "stream": request.stream,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        }),
        ApiFlavor::OpenAi | ApiFlavor::Generic => json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": request.stream,
        }),
    }
}

/// Headers for a generation request. Only the OpenAI flavor carries auth.
pub fn request_headers(flavor: ApiFlavor, api_key: Option<&str>) -> Vec<(String, String)> {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    if flavor == ApiFlavor::OpenAi {
        match api_key.filter(|k| !k.trim().is_empty()) {
            Some(key) => headers.push(("Authorization".to_string(), format!("Bearer {}", key))),
            None => tracing::warn!("using the OpenAI API without {} set", API_KEY_ENV_VAR),
        }
    }
    headers
}

/// First non-empty string found at any of `paths`, in order.
pub fn first_non_empty<'v, 'p>(
    value: &'v Value,
    paths: impl IntoIterator<Item = &'p &'p str>,
) -> Option<&'v str> {
    paths
        .into_iter()
        .filter_map(|path| value.pointer(path).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

/// Reply text of a complete (non-streaming) response, or `""`.
pub fn extract_full_content(body: &Value, flavor: ApiFlavor) -> String {
    let paths = flavor.full_content_paths().iter().chain(FULL_CONTENT_CHAIN);
    match first_non_empty(body, paths) {
        Some(content) => content.to_string(),
        None => {
            tracing::warn!(flavor = %flavor, "could not extract content from response");
            String::new()
        }
    }
}

/// Text carried by one decoded stream chunk, or `""`.
pub fn extract_stream_fragment(chunk: &Value, flavor: ApiFlavor) -> String {
    let paths = flavor.stream_fragment_paths().iter().chain(STREAM_FRAGMENT_CHAIN);
    first_non_empty(chunk, paths)
        .map(str::to_string)
        .unwrap_or_default()
}
