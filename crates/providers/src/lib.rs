//! Client for a locally hosted LLM backend.
//!
//! `protocol` knows the wire shapes of each backend flavor, `sse` turns a
//! response body into fragments, `transport` is the HTTP seam, and `client`
//! wraps all of it in retry, backoff and fallback handling.

pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod sse;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::LlmClient;
pub use error::RequestError;
pub use protocol::ApiFlavor;
pub use registry::ModelRegistry;

use shared::agent_api::ChatMessage;

/// One generation call, built fresh per request.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub stream: bool,
}

impl<'a> GenerationRequest<'a> {
    /// Temperature is clamped to `[0, 1]` and `max_tokens` floored at 1.
    pub fn new(
        messages: &'a [ChatMessage],
        model: impl Into<String>,
        temperature: f64,
        max_tokens: u32,
        stream: bool,
    ) -> Self {
        let temperature = if temperature.is_nan() {
            0.0
        } else {
            temperature.clamp(0.0, 1.0)
        };
        Self {
            messages,
            model: model.into(),
            temperature,
            max_tokens: max_tokens.max(1),
            stream,
        }
    }
}

/// Result of a non-streaming call: the reply, or a message for the user.
/// `content` is empty whenever `error` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub content: String,
    pub error: Option<String>,
    /// `content` is a canned stand-in, not model output.
    pub degraded: bool,
}

impl GenerationOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn degraded(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: None,
            degraded: true,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_parts(self) -> (String, Option<String>) {
        (self.content, self.error)
    }
}

/// First `max_chars` characters of `text`, with `...` appended when cut.
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_clamps_parameters() {
        let req = GenerationRequest::new(&[], "m", 1.7, 0, false);
        assert_eq!(req.temperature, 1.0);
        assert_eq!(req.max_tokens, 1);

        let req = GenerationRequest::new(&[], "m", -0.2, 512, true);
        assert_eq!(req.temperature, 0.0);
        assert_eq!(req.max_tokens, 512);
    }

    #[test]
    fn test_excerpt_is_char_aware() {
        assert_eq!(excerpt("short", 100), "short");
        assert_eq!(excerpt("abcdef", 3), "abc...");
        assert_eq!(excerpt("你好世界", 2), "你好...");
    }
}
