//! HTTP seam between the client and the network.
//!
//! The client only sees [`Transport`]; production uses [`HttpTransport`]
//! over reqwest, tests swap in a scripted one.

use crate::error::RequestError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Upper bound on the connect phase of any attempt.
pub const CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimeouts {
    pub connect: Duration,
    /// Time allowed for the response head, and between body reads.
    pub read: Duration,
}

#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub timeouts: AttemptTimeouts,
}

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, RequestError>>;

/// Status plus a lazily read body.
pub struct WireResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl std::fmt::Debug for WireResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl WireResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    pub fn from_bytes(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::from_chunks(status, vec![Ok(body.into())])
    }

    pub fn from_chunks(status: u16, chunks: Vec<Result<Vec<u8>, RequestError>>) -> Self {
        Self::new(status, stream::iter(chunks).boxed())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body. Each read is bounded by `read_timeout`.
    pub async fn read_to_end(self, read_timeout: Duration) -> Result<Vec<u8>, RequestError> {
        let mut body = self.body;
        let mut out = Vec::new();
        loop {
            match tokio::time::timeout(read_timeout, body.next()).await {
                Ok(Some(chunk)) => out.extend_from_slice(&chunk?),
                Ok(None) => return Ok(out),
                Err(_) => return Err(RequestError::Timeout),
            }
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a JSON POST. Resolves once the response head has arrived.
    async fn post(&self, request: &WireRequest) -> Result<WireResponse, RequestError>;

    /// Plain GET, used for the model listing probe.
    async fn get(&self, url: &str, timeout: Duration) -> Result<WireResponse, RequestError>;
}

pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    /// `base_timeout` is the configured request timeout; the connect phase
    /// gets at most [`CONNECT_TIMEOUT_CAP`] of it.
    pub fn new(base_timeout: Duration) -> Result<Self, RequestError> {
        let connect = if base_timeout.is_zero() {
            CONNECT_TIMEOUT_CAP
        } else {
            base_timeout.min(CONNECT_TIMEOUT_CAP)
        };
        let http = Client::builder()
            .connect_timeout(connect)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| RequestError::Unknown(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    fn into_wire(resp: reqwest::Response) -> WireResponse {
        let status = resp.status().as_u16();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(RequestError::from))
            .boxed();
        WireResponse::new(status, body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: &WireRequest) -> Result<WireResponse, RequestError> {
        // Headers first: `json()` only sets Content-Type when it is absent.
        let mut builder = self.http.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let send = builder.json(&request.body).send();

        let head_deadline = request.timeouts.connect.saturating_add(request.timeouts.read);
        let resp = tokio::time::timeout(head_deadline, send)
            .await
            .map_err(|_| RequestError::Timeout)??;
        Ok(Self::into_wire(resp))
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<WireResponse, RequestError> {
        let resp = self.http.get(url).timeout(timeout).send().await?;
        Ok(Self::into_wire(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::hang_up_listener;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String) -> WireRequest {
        WireRequest {
            url,
            headers: vec![
                ("Content-Type".into(), "application/json".into()),
                ("Authorization".into(), "Bearer sk-test".into()),
            ],
            body: json!({"model": "m", "stream": false}),
            timeouts: AttemptTimeouts {
                connect: Duration::from_secs(5),
                read: Duration::from_secs(5),
            },
        }
    }

    #[tokio::test]
    async fn test_post_sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "m"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let resp = transport
            .post(&request(format!("{}/api/chat", server.uri())))
            .await
            .unwrap();
        assert!(resp.is_success());
        let body = resp.read_to_end(Duration::from_secs(5)).await.unwrap();
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let resp = transport
            .post(&request(format!("{}/api/chat", server.uri())))
            .await
            .unwrap();
        assert_eq!(resp.status, 503);
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn test_slow_head_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let mut req = request(format!("{}/api/chat", server.uri()));
        req.timeouts = AttemptTimeouts {
            connect: Duration::from_millis(100),
            read: Duration::from_millis(100),
        };
        let err = transport.post(&req).await.unwrap_err();
        assert_eq!(err, RequestError::Timeout);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        // Port 9 on localhost is reserved for discard and normally closed.
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let err = transport
            .get("http://127.0.0.1:9/api/tags", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Connection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_peer_hang_up_is_connection_error() {
        let (base, accepted) = hang_up_listener(1);
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let err = transport
            .post(&request(format!("{}/api/chat", base)))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Connection(_)), "{err:?}");
        assert!(err.is_retryable());
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_to_end_joins_chunks() {
        let resp = WireResponse::from_chunks(200, vec![Ok(b"ab".to_vec()), Ok(b"cd".to_vec())]);
        let body = resp.read_to_end(Duration::from_secs(1)).await.unwrap();
        assert_eq!(body, b"abcd");

        let resp = WireResponse::from_chunks(
            200,
            vec![Ok(b"ab".to_vec()), Err(RequestError::Interrupted("reset".into()))],
        );
        assert!(matches!(
            resp.read_to_end(Duration::from_secs(1)).await,
            Err(RequestError::Interrupted(_))
        ));
    }
}
