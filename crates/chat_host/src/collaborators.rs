//! Seams to the parts of the front-end that live outside this crate.

use shared::agent_api::ChatMessage;

/// Where a turn's output goes. Fragments arrive in order and are rendered
/// before the next one is pulled.
pub trait Renderer {
    /// Status text that is not part of the reply (busy, cooldown, ...).
    fn notice(&mut self, text: &str);

    /// One piece of the assistant reply.
    fn fragment(&mut self, text: &str);

    fn error(&mut self, text: &str);

    /// The reply is complete.
    fn finish(&mut self) {}
}

pub trait EmotionDetector: Send + Sync {
    /// Emotion label for `text`, if one stands out.
    fn detect(&self, text: &str) -> Option<String>;

    /// Opening line acknowledging `emotion`.
    fn acknowledgement(&self, emotion: &str) -> Option<String>;
}

pub trait ModelSelector: Send + Sync {
    /// Model better suited to `prompt`, or `None` to keep the current one.
    fn select(&self, prompt: &str, history: &[ChatMessage]) -> Option<String>;
}

/// Renderer that records everything, for tests and scripted front-ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordingRenderer {
    pub notices: Vec<String>,
    pub fragments: Vec<String>,
    pub errors: Vec<String>,
    pub finished: usize,
}

impl Renderer for RecordingRenderer {
    fn notice(&mut self, text: &str) {
        self.notices.push(text.to_string());
    }

    fn fragment(&mut self, text: &str) {
        self.fragments.push(text.to_string());
    }

    fn error(&mut self, text: &str) {
        self.errors.push(text.to_string());
    }

    fn finish(&mut self) {
        self.finished += 1;
    }
}
