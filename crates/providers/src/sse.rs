//! Line-oriented decoding of streamed response bodies.
//!
//! Backends send either SSE (`data: {...}` lines ending in `data: [DONE]`)
//! or newline-delimited JSON, and a few send bare text. Everything here is
//! pure: bytes in, fragments out, no rendering.

use crate::error::RequestError;
use crate::protocol::{extract_full_content, extract_stream_fragment, ApiFlavor};
use crate::transport::WireResponse;
use futures::{Stream, StreamExt};
use serde_json::Value;
use shared::agent_api::Fragment;
use std::time::Duration;

/// End-of-stream sentinel carried in a `data:` line.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// SSE fields other than `data:`. Their values are single tokens, which
/// tells them apart from bare text that happens to start the same way.
const FIELD_PREFIXES: &[&str] = &["event:", "id:", "retry:"];

/// Incremental line splitter that buffers incomplete lines across chunk
/// boundaries. Works on bytes so a multi-byte character split between two
/// chunks is decoded intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the HTTP response. Returns any complete lines.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(decode_line_bytes(&line[..line.len() - 1]));
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line_bytes(&rest))
    }
}

fn decode_line_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// What a single line contributes to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Nothing to show (blank line, SSE bookkeeping, chunk without text).
    Skip,
    /// The end-of-stream sentinel.
    Done,
    Fragment(String),
}

/// True for `data:` lines and SSE field lines; once one has been seen the
/// body is treated as SSE.
pub fn is_sse_line(line: &str) -> bool {
    line.starts_with(DATA_PREFIX) || is_sse_field(line)
}

fn is_sse_field(line: &str) -> bool {
    FIELD_PREFIXES.iter().any(|prefix| {
        line.strip_prefix(prefix).is_some_and(|value| {
            let value = value.trim();
            !value.is_empty() && !value.contains(char::is_whitespace)
        })
    })
}

/// Decode one line. `sse` says whether the body has already shown itself to
/// be SSE, in which case `:` comment lines are dropped instead of shown.
///
/// `Err` is always a [`RequestError::MalformedChunk`]; the caller logs it
/// and moves on.
pub fn decode_line(line: &str, flavor: ApiFlavor, sse: bool) -> Result<LineEvent, RequestError> {
    if line.trim().is_empty() {
        return Ok(LineEvent::Skip);
    }

    if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.trim() == DONE_SENTINEL {
            return Ok(LineEvent::Done);
        }
        let chunk: Value = serde_json::from_str(payload)
            .map_err(|e| RequestError::MalformedChunk(format!("{}: {}", e, crate::excerpt(payload, 100))))?;
        return Ok(fragment_event(extract_stream_fragment(&chunk, flavor)));
    }

    if is_sse_field(line) || (sse && line.starts_with(':')) {
        return Ok(LineEvent::Skip);
    }

    match serde_json::from_str::<Value>(line) {
        Ok(chunk) => Ok(fragment_event(extract_stream_fragment(&chunk, flavor))),
        // Some backends emit plain text lines.
        Err(_) if !line.starts_with('{') && !line.starts_with('[') => {
            Ok(LineEvent::Fragment(line.to_string()))
        }
        Err(e) => Err(RequestError::MalformedChunk(format!(
            "{}: {}",
            e,
            crate::excerpt(line, 100)
        ))),
    }
}

fn fragment_event(text: String) -> LineEvent {
    if text.is_empty() {
        LineEvent::Skip
    } else {
        LineEvent::Fragment(text)
    }
}

/// Recover a reply from the raw body when the line loop produced nothing,
/// e.g. a backend that ignored `stream: true` and sent one JSON document.
pub fn fallback_from_body(raw: &[u8], flavor: ApiFlavor) -> Result<String, RequestError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(RequestError::EmptyResponse);
    }
    let text = String::from_utf8_lossy(raw).into_owned();
    match serde_json::from_str::<Value>(&text) {
        Ok(body) => {
            let content = extract_full_content(&body, flavor);
            if content.is_empty() {
                tracing::warn!("fallback parse found JSON without content, returning raw text");
                Ok(text)
            } else {
                Ok(content)
            }
        }
        Err(_) => {
            tracing::info!("fallback parse: response is not JSON, returning it as plain text");
            Ok(text)
        }
    }
}

/// Decode a streamed response into fragments.
///
/// Items are `Err` only for an attempt-level failure: the body went quiet for
/// longer than `read_timeout` before any content arrived. Malformed lines are
/// skipped, and a broken body falls through to [`fallback_from_body`].
pub fn decode_body(
    response: WireResponse,
    flavor: ApiFlavor,
    read_timeout: Duration,
) -> impl Stream<Item = Result<Fragment, RequestError>> + Send + 'static {
    async_stream::stream! {
        let mut body = response.body;
        let mut decoder = LineDecoder::new();
        let mut raw: Vec<u8> = Vec::new();
        let mut received_content = false;
        let mut sse = false;

        'read: loop {
            let (lines, eof) = match tokio::time::timeout(read_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    raw.extend_from_slice(&chunk);
                    (decoder.feed(&chunk), false)
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("error while reading streamed response: {}", e);
                    (decoder.finish().into_iter().collect(), true)
                }
                Ok(None) => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
                Err(_) if received_content => {
                    tracing::warn!(?read_timeout, "stream went quiet after content, ending it");
                    (Vec::new(), true)
                }
                Err(_) => {
                    yield Err(RequestError::Timeout);
                    return;
                }
            };

            for line in lines {
                sse = sse || is_sse_line(&line);
                match decode_line(&line, flavor, sse) {
                    Ok(LineEvent::Done) => {
                        tracing::info!("received end-of-stream marker");
                        break 'read;
                    }
                    Ok(LineEvent::Fragment(text)) => {
                        received_content = true;
                        yield Ok(Fragment::Content(text));
                    }
                    Ok(LineEvent::Skip) => {}
                    Err(e) => tracing::warn!("skipping line: {}", e),
                }
            }

            if eof {
                break;
            }
        }

        if !received_content {
            match fallback_from_body(&raw, flavor) {
                Ok(text) => yield Ok(Fragment::Content(text)),
                Err(e) => {
                    tracing::warn!("response had neither stream chunks nor a body");
                    yield Ok(Fragment::Error(e.user_message("")));
                }
            }
        }
    }
}
