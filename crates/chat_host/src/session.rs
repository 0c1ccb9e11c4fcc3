//! Per-conversation context: transcript, guard, cooldown clocks, cache and
//! the shared client. Nothing here is global; every front-end event goes
//! through the session it belongs to.

use crate::cache::ResponseCache;
use crate::collaborators::{EmotionDetector, ModelSelector};
use crate::guard::GenerationGuard;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use providers::LlmClient;
use serde::Serialize;
use shared::agent_api::ChatMessage;
use shared::config::{AppConfig, ConversationConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const TITLE_CHARS: usize = 30;

/// Automatic model switch recorded in the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelChange {
    pub from: String,
    pub to: String,
    /// Number of assistant replies before the switch.
    pub after_reply: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) title: Option<String>,
    pub(crate) transcript: Vec<ChatMessage>,
    pub(crate) model_changes: Vec<ModelChange>,
    pub(crate) last_submit: Option<Instant>,
    pub(crate) post_generate_until: Option<Instant>,
}

pub struct ChatSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    pub(crate) client: Arc<LlmClient>,
    pub(crate) conversation: ConversationConfig,
    max_display: usize,
    pub(crate) guard: GenerationGuard,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) cache: Option<Mutex<ResponseCache>>,
    pub(crate) emotion_detector: Option<Box<dyn EmotionDetector>>,
    pub(crate) model_selector: Option<Box<dyn ModelSelector>>,
}

impl ChatSession {
    pub fn new(client: Arc<LlmClient>, config: &AppConfig) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(%id, "new chat session");
        Self {
            id,
            created_at: Utc::now(),
            client,
            conversation: config.conversation.clone(),
            max_display: config.ui.max_message_display,
            guard: GenerationGuard::new(config.conversation.watchdog_timeout()),
            state: Mutex::new(SessionState::default()),
            cache: ResponseCache::from_config(&config.cache).map(Mutex::new),
            emotion_detector: None,
            model_selector: None,
        }
    }

    pub fn with_emotion_detector(mut self, detector: Option<Box<dyn EmotionDetector>>) -> Self {
        self.emotion_detector = detector;
        self
    }

    pub fn with_model_selector(mut self, selector: Option<Box<dyn ModelSelector>>) -> Self {
        self.model_selector = selector;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// First words of the opening question, once there is one.
    pub fn title(&self) -> Option<String> {
        self.state.lock().title.clone()
    }

    pub fn client(&self) -> &Arc<LlmClient> {
        &self.client
    }

    pub fn guard(&self) -> &GenerationGuard {
        &self.guard
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().transcript.clone()
    }

    /// The most recent messages, capped at `ui.max_message_display`.
    pub fn display_messages(&self) -> Vec<ChatMessage> {
        let state = self.state.lock();
        let start = state.transcript.len().saturating_sub(self.max_display);
        state.transcript[start..].to_vec()
    }

    pub fn model_changes(&self) -> Vec<ModelChange> {
        self.state.lock().model_changes.clone()
    }

    /// Time left before the front-end should accept the next message.
    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.state
            .lock()
            .post_generate_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Start over: clears the transcript and clocks, keeps the client and
    /// cached replies.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = SessionState::default();
        tracing::info!(id = %self.id, "session reset");
    }

    /// Append a user message, naming the session after the first one.
    pub(crate) fn record_user(state: &mut SessionState, prompt: &str) {
        if state.title.is_none() {
            let title: String = prompt.trim().chars().take(TITLE_CHARS).collect();
            if !title.is_empty() {
                state.title = Some(title);
            }
        }
        state.transcript.push(ChatMessage::user(prompt));
    }

    /// Store a finished reply and start the post-generation cooldown.
    pub(crate) fn record_reply(&self, reply: &str, now: Instant) {
        let mut state = self.state.lock();
        state
            .transcript
            .push(ChatMessage::assistant(reply.to_string()));
        let cooldown = self.conversation.post_generate_cooldown();
        state.post_generate_until = now.checked_add(cooldown).or(state.post_generate_until);
    }

    /// System message plus the tail of the transcript. The latest message is
    /// always included, even with a zero history limit.
    pub(crate) fn request_messages(&self, system_prompt: String) -> Vec<ChatMessage> {
        let state = self.state.lock();
        let window = self.conversation.max_history_messages.max(1);
        let start = state.transcript.len().saturating_sub(window);
        let mut messages = Vec::with_capacity(window + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(&state.transcript[start..]);
        messages
    }
}
