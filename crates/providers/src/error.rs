//! Failure taxonomy for requests against the model backend.
//!
//! These never cross the public client boundary as `Err`; the client turns
//! them into a [`crate::GenerationOutcome`] error or an error fragment.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("unauthorized (HTTP 401)")]
    Unauthorized,

    #[error("endpoint not found (HTTP 404)")]
    NotFound,

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("connection failed: {0}")]
    Connection(String),

    /// The response body broke off mid-transfer.
    #[error("response stream interrupted: {0}")]
    Interrupted(String),

    /// One stream line that could not be decoded. Always recovered locally.
    #[error("malformed stream chunk: {0}")]
    MalformedChunk(String),

    #[error("empty response body")]
    EmptyResponse,

    #[error("{0}")]
    Unknown(String),
}

impl RequestError {
    /// Map a non-success HTTP status to its error kind.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => RequestError::RateLimited,
            401 => RequestError::Unauthorized,
            404 => RequestError::NotFound,
            _ => RequestError::Http {
                status,
                body: crate::excerpt(body.trim(), 200),
            },
        }
    }

    /// Transient failures worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RequestError::Timeout | RequestError::RateLimited | RequestError::Connection(_)
        )
    }

    /// HTTP statuses that point at misconfiguration rather than a transient
    /// fault. Never retried.
    pub fn is_fatal_status(&self) -> bool {
        matches!(
            self,
            RequestError::Unauthorized | RequestError::NotFound | RequestError::Http { .. }
        )
    }

    /// Text shown to the user in place of a reply.
    pub fn user_message(&self, endpoint: &str) -> String {
        match self {
            RequestError::Timeout => "Request timed out, the server did not respond".to_string(),
            RequestError::RateLimited => "Server busy, please try again later".to_string(),
            RequestError::Unauthorized => "Invalid or missing API credentials".to_string(),
            RequestError::NotFound => format!(
                "Cannot reach the model backend at {}, verify it is running",
                endpoint
            ),
            RequestError::Http { status, body } => {
                if body.is_empty() {
                    format!("HTTP error {}", status)
                } else {
                    format!("HTTP error {}: {}", status, body)
                }
            }
            RequestError::Connection(_) => format!(
                "Connection error: unable to reach the API server ({}), check the network or that the service is running",
                endpoint
            ),
            RequestError::EmptyResponse => "No valid response received from the model".to_string(),
            RequestError::Interrupted(_)
            | RequestError::MalformedChunk(_)
            | RequestError::Unknown(_) => format!("Request failed: {}", self),
        }
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RequestError::Timeout
        } else if e.is_connect() {
            RequestError::Connection(e.to_string())
        } else if e.is_body() || e.is_decode() {
            RequestError::Interrupted(e.to_string())
        } else if is_dropped_connection(&e) {
            RequestError::Connection(e.to_string())
        } else {
            RequestError::Unknown(e.to_string())
        }
    }
}

/// The peer accepted the connection and then closed or reset it before a
/// response head arrived.
fn is_dropped_connection(e: &reqwest::Error) -> bool {
    use std::io::ErrorKind;

    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        if let Some(hyper) = err.downcast_ref::<hyper::Error>() {
            if hyper.is_incomplete_message() || hyper.is_closed() || hyper.is_canceled() {
                return true;
            }
        }
        source = err.source();
    }
    false
}
