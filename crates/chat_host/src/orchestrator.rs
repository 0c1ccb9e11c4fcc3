//! One user turn, from submission to rendered reply.

use crate::cache::ResponseCache;
use crate::collaborators::Renderer;
use crate::guard::GenerationPermit;
use crate::prompts::{self, Language};
use crate::session::{ChatSession, ModelChange};
use futures::StreamExt;
use providers::GenerationOutcome;
use shared::agent_api::{ChatMessage, Fragment, Role};
use shared::config::AppConfig;
use std::time::{Duration, Instant};

const EMPTY_REPLY: &str = "No valid response received from the model";

const DEFAULT_MODEL: &str = "qwen2.5:3b";
const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Per-turn knobs, as set in the front-end.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSettings {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub language: Language,
    pub concise: bool,
    /// Render fragments as they arrive. When off, the reply is generated in
    /// one call and may be served from the cache.
    pub stream: bool,
    pub use_cache: bool,
    /// Plain text to answer from instead of the conversation.
    pub document: Option<String>,
}

impl TurnSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let model = config
            .ordered_model_ids()
            .into_iter()
            .next()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let max_tokens = config
            .models
            .get(&model)
            .and_then(|info| info.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        Self {
            model,
            temperature: 0.7,
            max_tokens,
            language: Language::default(),
            concise: config.conversation.concise_by_default,
            stream: true,
            use_cache: true,
            document: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Stream,
    Generated,
    Cache,
    Document,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Another generation is still running.
    Busy,
    /// Submitted too soon after the previous message.
    CoolingDown { remaining: Duration },
    Replied {
        content: String,
        model: String,
        source: ReplySource,
    },
    Failed { error: String },
}

type TurnResult = Result<(String, ReplySource), String>;

impl ChatSession {
    /// Run one turn. The guard is held for the whole turn and released on
    /// every exit path.
    pub async fn handle_user_input(
        &self,
        prompt: &str,
        settings: &TurnSettings,
        renderer: &mut dyn Renderer,
    ) -> TurnOutcome {
        let now = Instant::now();
        let Some(permit) = self.guard.acquire(now) else {
            tracing::info!(id = %self.id(), "generation in progress, rejecting input");
            renderer.notice(prompts::busy_notice(settings.language));
            return TurnOutcome::Busy;
        };

        if let Some(remaining) = self.check_cooldown(now) {
            tracing::info!(?remaining, "submitted during cooldown");
            renderer.notice(&prompts::cooldown_notice(settings.language, remaining));
            return TurnOutcome::CoolingDown { remaining };
        }

        {
            let mut state = self.state.lock();
            state.last_submit = Some(now);
            Self::record_user(&mut state, prompt);
        }

        let messages = self.request_messages(self.build_system_prompt(prompt, settings));
        let model = self.choose_model(prompt, settings);

        let result = match settings.document.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(document) => self.document_turn(prompt, document, &model, settings, renderer).await,
            None if !settings.stream => self.generated_turn(&messages, &model, settings, renderer).await,
            None => self.streamed_turn(&messages, &model, settings, &permit, renderer).await,
        };
        renderer.finish();

        match result {
            Ok((content, source)) => {
                if permit.is_current() {
                    self.record_reply(&content, Instant::now());
                    tracing::info!(chars = content.len(), ?source, "turn complete");
                } else {
                    tracing::warn!(id = %self.id(), "turn was taken over while generating, reply not recorded");
                }
                TurnOutcome::Replied {
                    content,
                    model: self.client.validate_model(&model),
                    source,
                }
            }
            Err(error) => TurnOutcome::Failed { error },
        }
    }

    fn check_cooldown(&self, now: Instant) -> Option<Duration> {
        let cooldown = self.conversation.cooldown();
        let last = self.state.lock().last_submit?;
        let since = now.saturating_duration_since(last);
        (!cooldown.is_zero() && since < cooldown).then(|| cooldown - since)
    }

    fn build_system_prompt(&self, prompt: &str, settings: &TurnSettings) -> String {
        let language = settings.language;
        let mut system = prompts::system_prompt(language).to_string();

        if let Some(detector) = &self.emotion_detector {
            if let Some(emotion) = detector.detect(prompt) {
                if let Some(ack) = detector.acknowledgement(&emotion).filter(|a| !a.is_empty()) {
                    tracing::debug!(%emotion, "adding emotion note");
                    system = prompts::with_emotion_note(system, language, &emotion, &ack);
                }
            }
        }

        if settings.concise {
            system = prompts::with_concise_suffix(system, language);
        }
        system
    }

    fn choose_model(&self, prompt: &str, settings: &TurnSettings) -> String {
        let Some(selector) = &self.model_selector else {
            return settings.model.clone();
        };

        let mut state = self.state.lock();
        match selector.select(prompt, &state.transcript) {
            Some(model) if model != settings.model => {
                tracing::info!(from = %settings.model, to = %model, "switching model");
                let after_reply = state
                    .transcript
                    .iter()
                    .filter(|m| m.role == Role::Assistant)
                    .count();
                state.model_changes.push(ModelChange {
                    from: settings.model.clone(),
                    to: model.clone(),
                    after_reply,
                });
                model
            }
            _ => settings.model.clone(),
        }
    }

    async fn document_turn(
        &self,
        prompt: &str,
        document: &str,
        model: &str,
        settings: &TurnSettings,
        renderer: &mut dyn Renderer,
    ) -> TurnResult {
        renderer.notice(prompts::document_notice(settings.language));
        let messages = [ChatMessage::user(prompts::document_prompt(
            settings.language,
            document,
            prompt,
        ))];
        let outcome = self
            .client
            .generate(&messages, model, settings.temperature, settings.max_tokens, false)
            .await;
        render_outcome(outcome, ReplySource::Document, renderer)
    }

    async fn generated_turn(
        &self,
        messages: &[ChatMessage],
        model: &str,
        settings: &TurnSettings,
        renderer: &mut dyn Renderer,
    ) -> TurnResult {
        let cache = self.cache.as_ref().filter(|_| settings.use_cache);
        let key = ResponseCache::key(messages, model, settings.temperature, settings.max_tokens);

        if let Some(cache) = cache {
            let hit = cache.lock().get(&key, Instant::now());
            if let Some(content) = hit {
                tracing::debug!("serving reply from cache");
                renderer.fragment(&content);
                return Ok((content, ReplySource::Cache));
            }
        }

        let outcome = self
            .client
            .generate(messages, model, settings.temperature, settings.max_tokens, false)
            .await;

        if let Some(cache) = cache {
            if outcome.is_ok() && !outcome.degraded && !outcome.content.is_empty() {
                cache.lock().insert(key, outcome.content.clone(), Instant::now());
            }
        }
        render_outcome(outcome, ReplySource::Generated, renderer)
    }

    async fn streamed_turn(
        &self,
        messages: &[ChatMessage],
        model: &str,
        settings: &TurnSettings,
        permit: &GenerationPermit<'_>,
        renderer: &mut dyn Renderer,
    ) -> TurnResult {
        let mut stream =
            self.client
                .generate_stream(messages, model, settings.temperature, settings.max_tokens);
        let mut reply = String::new();
        let mut error = None;

        while let Some(fragment) = stream.next().await {
            permit.refresh(Instant::now());
            match fragment {
                Fragment::Content(text) if text.is_empty() => {}
                Fragment::Content(text) => {
                    renderer.fragment(&text);
                    reply.push_str(&text);
                }
                Fragment::Error(message) => {
                    renderer.error(&message);
                    error = Some(message);
                }
            }
        }

        if !reply.is_empty() {
            return Ok((reply, ReplySource::Stream));
        }
        match error {
            Some(message) => Err(message),
            None => {
                renderer.error(EMPTY_REPLY);
                Err(EMPTY_REPLY.to_string())
            }
        }
    }
}

fn render_outcome(outcome: GenerationOutcome, source: ReplySource, renderer: &mut dyn Renderer) -> TurnResult {
    match outcome.into_parts() {
        (_, Some(error)) => {
            renderer.error(&error);
            Err(error)
        }
        (content, None) if content.is_empty() => {
            renderer.error(EMPTY_REPLY);
            Err(EMPTY_REPLY.to_string())
        }
        (content, None) => {
            renderer.fragment(&content);
            Ok((content, source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{EmotionDetector, ModelSelector, RecordingRenderer};
    use providers::registry::ModelRegistry;
    use providers::testing::ScriptedTransport;
    use providers::{LlmClient, RequestError};
    use serde_json::{json, Value};
    use std::sync::Arc;

    const OLLAMA_REPLY: &str = "{\"message\":{\"content\":\"Bon\"},\"done\":false}\n\
                                {\"message\":{\"content\":\"jour\"},\"done\":false}\n\
                                {\"done\":true}\n";

    fn session_with(transport: ScriptedTransport, overrides: Value) -> (ChatSession, Arc<ScriptedTransport>) {
        let mut merged = json!({
            "api": {"retry_delay": 0.0},
            "conversation": {"cooldown_seconds": 0.0}
        });
        shared::config::deep_merge(&mut merged, overrides);
        let config = AppConfig::with_overrides(merged).unwrap();

        let transport = Arc::new(transport);
        let client = LlmClient::from_parts(
            &config.api,
            transport.clone(),
            ModelRegistry::from_config(&config),
        );
        (ChatSession::new(Arc::new(client), &config), transport)
    }

    fn settings() -> TurnSettings {
        TurnSettings::from_config(&AppConfig::default())
    }

    fn sync_reply(text: &str) -> String {
        json!({"message": {"role": "assistant", "content": text}}).to_string()
    }

    #[test]
    fn test_settings_from_config() {
        let settings = settings();
        assert_eq!(settings.model, "qwen2.5:3b");
        assert_eq!(settings.max_tokens, 2048);
        assert!(settings.stream);
        assert!(settings.concise);
    }

    #[tokio::test]
    async fn test_streamed_turn_records_reply() {
        let (session, transport) =
            session_with(ScriptedTransport::new().then_respond(200, OLLAMA_REPLY), json!({}));
        let mut renderer = RecordingRenderer::default();

        let outcome = session
            .handle_user_input("Say hello in French", &settings(), &mut renderer)
            .await;

        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                content: "Bonjour".into(),
                model: "qwen2.5:3b".into(),
                source: ReplySource::Stream,
            }
        );
        assert_eq!(renderer.fragments, ["Bon", "jour"]);
        assert_eq!(renderer.finished, 1);
        assert_eq!(
            session.messages(),
            vec![
                ChatMessage::user("Say hello in French"),
                ChatMessage::assistant("Bonjour")
            ]
        );
        assert!(!session.guard().is_generating());
        assert!(session.cooldown_remaining(Instant::now()) > Duration::ZERO);
        assert_eq!(session.title().as_deref(), Some("Say hello in French"));

        let body = &transport.requests()[0].body;
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Say hello in French");
    }

    /// Takes the guard over from the running turn on its first fragment.
    struct TakeoverRenderer<'a> {
        guard: &'a crate::guard::GenerationGuard,
        takeover: Option<GenerationPermit<'a>>,
        inner: RecordingRenderer,
    }

    impl Renderer for TakeoverRenderer<'_> {
        fn notice(&mut self, text: &str) {
            self.inner.notice(text);
        }

        fn fragment(&mut self, text: &str) {
            if self.takeover.is_none() {
                let stale = Instant::now() + Duration::from_secs(3600);
                self.takeover = self.guard.acquire(stale);
            }
            self.inner.fragment(text);
        }

        fn error(&mut self, text: &str) {
            self.inner.error(text);
        }
    }

    #[tokio::test]
    async fn test_superseded_turn_leaves_transcript_alone() {
        let (session, _transport) =
            session_with(ScriptedTransport::new().then_respond(200, OLLAMA_REPLY), json!({}));
        let mut renderer = TakeoverRenderer {
            guard: session.guard(),
            takeover: None,
            inner: RecordingRenderer::default(),
        };

        let outcome = session
            .handle_user_input("Say hello in French", &settings(), &mut renderer)
            .await;

        assert!(renderer.takeover.is_some());
        assert!(matches!(outcome, TurnOutcome::Replied { .. }));
        assert_eq!(session.messages(), vec![ChatMessage::user("Say hello in French")]);
        assert_eq!(session.cooldown_remaining(Instant::now()), Duration::ZERO);
        assert!(session.guard().is_generating());

        drop(renderer);
        assert!(!session.guard().is_generating());
    }

    #[tokio::test]
    async fn test_busy_session_rejects_input() {
        let (session, transport) = session_with(ScriptedTransport::new(), json!({}));
        let _permit = session.guard().acquire(Instant::now()).unwrap();
        let mut renderer = RecordingRenderer::default();

        let outcome = session.handle_user_input("hello", &settings(), &mut renderer).await;
        assert_eq!(outcome, TurnOutcome::Busy);
        assert_eq!(renderer.notices, [prompts::busy_notice(Language::Zh)]);
        assert!(session.messages().is_empty());
        assert_eq!(transport.post_count(), 0);
    }

    #[tokio::test]
    async fn test_rapid_resubmission_cools_down() {
        let (session, transport) = session_with(
            ScriptedTransport::new().then_respond(200, OLLAMA_REPLY),
            json!({"conversation": {"cooldown_seconds": 30.0}}),
        );
        let mut renderer = RecordingRenderer::default();

        session.handle_user_input("first", &settings(), &mut renderer).await;
        let outcome = session.handle_user_input("second", &settings(), &mut renderer).await;

        match outcome {
            TurnOutcome::CoolingDown { remaining } => {
                assert!(remaining > Duration::from_secs(29));
                assert!(remaining <= Duration::from_secs(30));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert_eq!(session.messages().len(), 2);
        assert_eq!(transport.post_count(), 1);
        assert!(!session.guard().is_generating());
    }

    #[tokio::test]
    async fn test_error_fragment_not_added_to_history() {
        let (session, transport) =
            session_with(ScriptedTransport::new().then_respond(401, "bad key"), json!({}));
        let mut renderer = RecordingRenderer::default();

        let outcome = session.handle_user_input("hi", &settings(), &mut renderer).await;
        assert_eq!(
            outcome,
            TurnOutcome::Failed {
                error: "Invalid or missing API credentials".into()
            }
        );
        assert_eq!(renderer.errors.len(), 1);
        assert!(renderer.fragments.is_empty());
        assert_eq!(session.messages(), vec![ChatMessage::user("hi")]);
        assert_eq!(session.cooldown_remaining(Instant::now()), Duration::ZERO);
        assert_eq!(transport.post_count(), 1);
    }

    #[tokio::test]
    async fn test_non_streamed_turn_uses_cache() {
        let (session, transport) = session_with(
            ScriptedTransport::new().then_respond(200, sync_reply("Paris.")),
            json!({}),
        );
        let settings = TurnSettings {
            stream: false,
            ..settings()
        };
        let mut renderer = RecordingRenderer::default();

        let first = session.handle_user_input("Capital of France?", &settings, &mut renderer).await;
        session.reset();
        let second = session.handle_user_input("Capital of France?", &settings, &mut renderer).await;

        assert!(matches!(first, TurnOutcome::Replied { source: ReplySource::Generated, .. }));
        assert!(matches!(second, TurnOutcome::Replied { source: ReplySource::Cache, .. }));
        assert_eq!(renderer.fragments, ["Paris.", "Paris."]);
        assert_eq!(transport.post_count(), 1);
        assert_eq!(transport.requests()[0].body["stream"], false);
    }

    #[tokio::test]
    async fn test_cache_can_be_bypassed() {
        let (session, transport) = session_with(
            ScriptedTransport::new()
                .then_respond(200, sync_reply("one"))
                .then_respond(200, sync_reply("two")),
            json!({}),
        );
        let settings = TurnSettings {
            stream: false,
            use_cache: false,
            ..settings()
        };
        let mut renderer = RecordingRenderer::default();
        session.handle_user_input("q", &settings, &mut renderer).await;
        session.reset();
        session.handle_user_input("q", &settings, &mut renderer).await;
        assert_eq!(transport.post_count(), 2);
    }

    #[tokio::test]
    async fn test_degraded_reply_is_not_cached() {
        let (session, transport) = session_with(
            ScriptedTransport::new().always_fail(RequestError::Connection("refused".into())),
            json!({"api": {"max_retries": 1}}),
        );
        let settings = TurnSettings {
            stream: false,
            ..settings()
        };
        let mut renderer = RecordingRenderer::default();

        let outcome = session.handle_user_input("are you there?", &settings, &mut renderer).await;
        assert!(matches!(outcome, TurnOutcome::Replied { .. }));
        session.reset();
        session.handle_user_input("are you there?", &settings, &mut renderer).await;
        assert_eq!(transport.post_count(), 2);
    }

    #[tokio::test]
    async fn test_document_turn() {
        let (session, transport) = session_with(
            ScriptedTransport::new().then_respond(200, sync_reply("It shipped in 2015.")),
            json!({}),
        );
        let settings = TurnSettings {
            language: Language::En,
            document: Some("Rust 1.0 was released in May 2015.".into()),
            ..settings()
        };
        let mut renderer = RecordingRenderer::default();

        let outcome = session.handle_user_input("When was Rust 1.0 released?", &settings, &mut renderer).await;
        assert!(matches!(outcome, TurnOutcome::Replied { source: ReplySource::Document, .. }));
        assert_eq!(renderer.notices, [prompts::document_notice(Language::En)]);

        let body = &transport.requests()[0].body;
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        let content = messages[0]["content"].as_str().unwrap();
        assert!(content.contains("Rust 1.0 was released in May 2015."));
        assert!(content.ends_with("Question: When was Rust 1.0 released?"));
        assert_eq!(session.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_history_window() {
        let mut transport = ScriptedTransport::new();
        for _ in 0..3 {
            transport = transport.then_respond(200, OLLAMA_REPLY);
        }
        let (session, transport) =
            session_with(transport, json!({"conversation": {"max_history_messages": 2}}));
        let mut renderer = RecordingRenderer::default();

        for prompt in ["one", "two", "three"] {
            session.handle_user_input(prompt, &settings(), &mut renderer).await;
        }

        let last = &transport.requests()[2].body["messages"];
        let last = last.as_array().unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[1]["role"], "assistant");
        assert_eq!(last[2]["content"], "three");
    }

    struct AlwaysLlama;

    impl ModelSelector for AlwaysLlama {
        fn select(&self, _prompt: &str, _history: &[ChatMessage]) -> Option<String> {
            Some("llama3.1:latest".into())
        }
    }

    struct Cheerful;

    impl EmotionDetector for Cheerful {
        fn detect(&self, text: &str) -> Option<String> {
            text.contains('!').then(|| "happy".to_string())
        }

        fn acknowledgement(&self, _emotion: &str) -> Option<String> {
            Some("Glad to hear it!".into())
        }
    }

    #[tokio::test]
    async fn test_collaborators_shape_request() {
        let (session, transport) =
            session_with(ScriptedTransport::new().then_respond(200, OLLAMA_REPLY), json!({}));
        let session = session
            .with_model_selector(Some(Box::new(AlwaysLlama)))
            .with_emotion_detector(Some(Box::new(Cheerful)));
        let settings = TurnSettings {
            language: Language::En,
            ..settings()
        };
        let mut renderer = RecordingRenderer::default();

        let outcome = session.handle_user_input("I got the job!", &settings, &mut renderer).await;
        assert!(matches!(outcome, TurnOutcome::Replied { ref model, .. } if model == "llama3.1:latest"));

        let body = &transport.requests()[0].body;
        assert_eq!(body["model"], "llama3.1:latest");
        let system = body["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("The user's emotion seems to be happy"));
        assert!(system.contains("Glad to hear it!"));
        assert!(system.ends_with("provide key points when necessary."));

        assert_eq!(
            session.model_changes(),
            vec![ModelChange {
                from: "qwen2.5:3b".into(),
                to: "llama3.1:latest".into(),
                after_reply: 0,
            }]
        );
    }

    #[tokio::test]
    async fn test_reset_clears_transcript() {
        let (session, _transport) =
            session_with(ScriptedTransport::new().then_respond(200, OLLAMA_REPLY), json!({}));
        let mut renderer = RecordingRenderer::default();
        session.handle_user_input("hello", &settings(), &mut renderer).await;

        session.reset();
        assert!(session.messages().is_empty());
        assert_eq!(session.title(), None);
        assert_eq!(session.cooldown_remaining(Instant::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_display_messages_capped() {
        let mut transport = ScriptedTransport::new();
        for _ in 0..2 {
            transport = transport.then_respond(200, OLLAMA_REPLY);
        }
        let (session, _transport) = session_with(transport, json!({"ui": {"max_message_display": 3}}));
        let mut renderer = RecordingRenderer::default();
        session.handle_user_input("one", &settings(), &mut renderer).await;
        session.handle_user_input("two", &settings(), &mut renderer).await;

        let shown = session.display_messages();
        assert_eq!(shown.len(), 3);
        assert_eq!(shown[0], ChatMessage::assistant("Bonjour"));
    }
}
