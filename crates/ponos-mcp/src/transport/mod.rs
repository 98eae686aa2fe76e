//! Transport layer for the tool server
//!
//! The server streams replies over one long-lived SSE connection and accepts
//! requests by POST on a session-scoped endpoint announced at stream start.

use ponos_core::{PonosError, Result};
use url::Url;

use crate::types::Envelope;

pub mod sse;

pub use sse::{SseStream, SseTransport};

/// Fallback when no server URL is configured.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:3001";

/// Receives what the stream reader observes.
///
/// Called from the reader task; implementations must not block.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_message(&self, envelope: Envelope);

    /// Fired once when an established stream ends for any reason. Failures
    /// before the endpoint is announced are returned from `open` instead.
    fn on_closed(&self, reason: String);
}

/// Where requests for one stream generation are submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoint {
    pub url: Url,
    pub session_id: Option<String>,
}

/// Split a configured URL into `(base, stream_url)`.
///
/// A URL already ending in `/sse` is the stream URL and its parent is the
/// base; otherwise `/sse` is appended.
pub fn normalize_server_url(server_url: &str) -> (String, String) {
    let trimmed = server_url.trim();
    let trimmed = if trimmed.is_empty() {
        DEFAULT_SERVER_URL
    } else {
        trimmed
    };
    let trimmed = trimmed.trim_end_matches('/');

    match trimmed.strip_suffix("/sse") {
        Some(base) => (base.to_string(), trimmed.to_string()),
        None => (trimmed.to_string(), format!("{}/sse", trimmed)),
    }
}

/// Resolve the payload of an `endpoint` event against the base URL.
pub fn resolve_endpoint(base: &str, data: &str) -> Result<SessionEndpoint> {
    let raw = data.trim();
    if raw.is_empty() {
        return Err(PonosError::Protocol("empty endpoint event".into()));
    }

    let decoded = urlencoding::decode(raw)
        .map_err(|e| PonosError::Protocol(format!("endpoint is not valid UTF-8: {}", e)))?;

    // Relative references resolve under the base, not beside its last segment.
    let base = if base.ends_with('/') {
        Url::parse(base)
    } else {
        Url::parse(&format!("{}/", base))
    }
    .map_err(|e| PonosError::Protocol(format!("invalid server URL '{}': {}", base, e)))?;

    let url = base
        .join(&decoded)
        .map_err(|e| PonosError::Protocol(format!("invalid endpoint '{}': {}", decoded, e)))?;

    let session_id = url
        .query_pairs()
        .find(|(key, _)| key == "sessionId")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty());

    Ok(SessionEndpoint { url, session_id })
}
