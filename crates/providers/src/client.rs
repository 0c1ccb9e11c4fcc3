//! The LLM client: request shaping, retry with backoff, and the fallbacks
//! that keep every call total. Callers never see an `Err`; failures come
//! back as a [`GenerationOutcome`] error or a [`Fragment::Error`].

use crate::error::RequestError;
use crate::protocol::{self, ApiFlavor, API_KEY_ENV_VAR};
use crate::registry::ModelRegistry;
use crate::sse;
use crate::transport::{
    AttemptTimeouts, HttpTransport, Transport, WireRequest, WireResponse, CONNECT_TIMEOUT_CAP,
};
use crate::{excerpt, GenerationOutcome, GenerationRequest};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use shared::agent_api::{ChatMessage, Fragment};
use shared::config::{ApiConfig, AppConfig};
use std::sync::Arc;
use std::time::Duration;

/// Minimum read timeout for non-streaming calls, which wait for the whole
/// reply at once.
const SYNC_READ_FLOOR: Duration = Duration::from_secs(30);

const NO_ATTEMPTS_MESSAGE: &str = "No request attempts were configured";

pub struct LlmClient {
    transport: Arc<dyn Transport>,
    endpoint: String,
    flavor: ApiFlavor,
    max_retries: u32,
    retry_delay: Duration,
    base_timeout: Duration,
    stream_read_timeout: Duration,
    api_key: Option<String>,
    registry: ModelRegistry,
}

impl LlmClient {
    /// Build a client over HTTP and probe the backend for its models.
    pub async fn connect(config: &AppConfig) -> Result<Self, RequestError> {
        let transport = Arc::new(HttpTransport::new(config.api.timeout())?);
        Ok(Self::with_transport(config, transport).await)
    }

    pub async fn with_transport(config: &AppConfig, transport: Arc<dyn Transport>) -> Self {
        let flavor = ApiFlavor::detect(&config.api.endpoint);
        let registry =
            ModelRegistry::probe(transport.as_ref(), &config.api.endpoint, flavor, config).await;
        let client = Self::from_parts(&config.api, transport, registry);
        tracing::info!(
            endpoint = %client.endpoint,
            flavor = %client.flavor,
            models = client.registry.models().len(),
            "LLM client ready"
        );
        client
    }

    /// Assemble a client without probing. The API key is read from the
    /// environment.
    pub fn from_parts(api: &ApiConfig, transport: Arc<dyn Transport>, registry: ModelRegistry) -> Self {
        let api_key = std::env::var(API_KEY_ENV_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self {
            transport,
            endpoint: api.endpoint.clone(),
            flavor: ApiFlavor::detect(&api.endpoint),
            max_retries: api.max_retries,
            retry_delay: api.retry_delay(),
            base_timeout: api.timeout(),
            stream_read_timeout: api.stream_read_timeout(),
            api_key,
            registry,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn flavor(&self) -> ApiFlavor {
        self.flavor
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// The id that will actually be sent for `model`.
    pub fn validate_model(&self, model: &str) -> String {
        self.registry.resolve(model)
    }

    /// Timeouts grow by half the base timeout per attempt.
    fn attempt_timeouts(&self, attempt: u32, read_floor: Duration) -> AttemptTimeouts {
        let current = self.base_timeout.mul_f64(1.0 + 0.5 * f64::from(attempt));
        let connect = if current.is_zero() {
            CONNECT_TIMEOUT_CAP
        } else {
            current.min(CONNECT_TIMEOUT_CAP)
        };
        AttemptTimeouts {
            connect,
            read: current.max(read_floor),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    fn wire_request(&self, request: &GenerationRequest<'_>, read_floor: Duration) -> WireRequest {
        let body = protocol::build_request(request, self.flavor);
        tracing::debug!(
            flavor = %self.flavor,
            model = %request.model,
            messages = request.messages.len(),
            stream = request.stream,
            "prepared request"
        );
        WireRequest {
            url: self.endpoint.clone(),
            headers: protocol::request_headers(self.flavor, self.api_key.as_deref()),
            body,
            timeouts: self.attempt_timeouts(0, read_floor),
        }
    }

    /// POST once. Non-2xx statuses become errors after their body is logged.
    async fn send(&self, request: &WireRequest) -> Result<WireResponse, RequestError> {
        let response = self.transport.post(request).await?;
        tracing::info!(status = response.status, "response received");
        if response.is_success() {
            return Ok(response);
        }

        let status = response.status;
        let body = response
            .read_to_end(request.timeouts.read)
            .await
            .unwrap_or_default();
        let body = String::from_utf8_lossy(&body);
        let error = RequestError::from_status(status, &body);
        if error.is_retryable() {
            tracing::warn!(status, "backend asked us to back off");
        } else {
            tracing::error!(status, body = %excerpt(&body, 500), "request rejected");
        }
        Err(error)
    }

    /// One attempt of a non-streaming call. With `stream` set, the streamed
    /// fragments are concatenated.
    async fn attempt_once(&self, request: &WireRequest, stream: bool) -> Result<String, RequestError> {
        let response = self.send(request).await?;

        if stream {
            let mut fragments =
                std::pin::pin!(sse::decode_body(response, self.flavor, request.timeouts.read));
            let mut content = String::new();
            while let Some(fragment) = fragments.next().await {
                match fragment? {
                    Fragment::Content(text) => content.push_str(&text),
                    Fragment::Error(_) => return Err(RequestError::EmptyResponse),
                }
            }
            return Ok(content);
        }

        let body = response.read_to_end(request.timeouts.read).await?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| RequestError::Unknown(format!("invalid JSON response: {}", e)))?;
        Ok(protocol::extract_full_content(&value, self.flavor))
    }

    /// Generate a complete reply. Never fails: errors are reported through
    /// [`GenerationOutcome::error`].
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: u32,
        stream: bool,
    ) -> GenerationOutcome {
        if self.max_retries == 0 {
            tracing::warn!("max_retries is 0, not sending anything");
            return GenerationOutcome::failure(NO_ATTEMPTS_MESSAGE);
        }

        let request = GenerationRequest::new(
            messages,
            self.validate_model(model),
            temperature,
            max_tokens,
            stream,
        );
        let read_floor = if stream {
            self.stream_read_timeout
        } else {
            SYNC_READ_FLOOR
        };
        let mut wire = self.wire_request(&request, read_floor);

        let mut attempt = 0;
        loop {
            wire.timeouts = self.attempt_timeouts(attempt, read_floor);
            tracing::info!(attempt = attempt + 1, of = self.max_retries, "sending request");

            match self.attempt_once(&wire, stream).await {
                Ok(content) => return GenerationOutcome::success(content),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_retries => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(attempt = attempt + 1, ?delay, "{}, retrying", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return self.final_failure(e, messages),
            }
        }
    }

    fn final_failure(&self, error: RequestError, messages: &[ChatMessage]) -> GenerationOutcome {
        if let RequestError::Connection(_) = &error {
            if let Some(reply) = degraded_reply(messages) {
                tracing::warn!(endpoint = %self.endpoint, "backend unreachable, returning degraded reply");
                return GenerationOutcome::degraded(reply);
            }
        }
        tracing::error!(endpoint = %self.endpoint, "generation failed: {}", error);
        GenerationOutcome::failure(error.user_message(&self.endpoint))
    }

    /// Stream the reply fragment by fragment.
    ///
    /// Failures before the body arrives are retried unless the status is
    /// fatal; the last one is yielded as a single [`Fragment::Error`]. The
    /// stream is lazy: nothing is sent until it is polled.
    pub fn generate_stream<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> BoxStream<'a, Fragment> {
        let model = self.validate_model(model);

        Box::pin(async_stream::stream! {
            if self.max_retries == 0 {
                tracing::warn!("max_retries is 0, not sending anything");
                yield Fragment::Error(NO_ATTEMPTS_MESSAGE.to_string());
                return;
            }

            let request = GenerationRequest::new(messages, model, temperature, max_tokens, true);
            let mut wire = self.wire_request(&request, self.stream_read_timeout);

            let mut attempt = 0;
            loop {
                wire.timeouts = self.attempt_timeouts(attempt, self.stream_read_timeout);
                tracing::info!(attempt = attempt + 1, of = self.max_retries, "sending streaming request");

                let failure = match self.send(&wire).await {
                    Ok(response) => {
                        let mut fragments = std::pin::pin!(
                            sse::decode_body(response, self.flavor, wire.timeouts.read)
                        );
                        let mut failure = None;
                        while let Some(item) = fragments.next().await {
                            match item {
                                Ok(fragment) => yield fragment,
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }
                        match failure {
                            Some(e) => e,
                            None => return,
                        }
                    }
                    Err(e) => e,
                };

                if !failure.is_fatal_status() && attempt + 1 < self.max_retries {
                    let delay = self.backoff(attempt);
                    tracing::warn!(attempt = attempt + 1, ?delay, "{}, retrying stream", failure);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                tracing::error!(endpoint = %self.endpoint, "streaming failed: {}", failure);
                yield Fragment::Error(self.stream_failure_message(&failure));
                return;
            }
        })
    }

    fn stream_failure_message(&self, error: &RequestError) -> String {
        match error {
            RequestError::Connection(_) => format!(
                "Unable to reach the API server ({}), check the network or that the service is running",
                self.endpoint
            ),
            RequestError::Timeout
            | RequestError::RateLimited
            | RequestError::Unauthorized
            | RequestError::NotFound
            | RequestError::Http { .. } => error.user_message(&self.endpoint),
            other => format!("Error during generation: {}", other),
        }
    }
}

/// Canned reply used when the backend stayed unreachable, so the user sees
/// their question acknowledged instead of a blank failure.
fn degraded_reply(messages: &[ChatMessage]) -> Option<String> {
    let last = messages.last()?;
    Some(format!(
        "Unable to reach the model service. Your question was about: \"{}\". Please check that the API service is running.",
        excerpt(&last.content, 100)
    ))
}
