use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One file written by a multi-file commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpdate {
    pub path: String,
    pub content: String,
}

impl FileUpdate {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// A single container image reference rewritten in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUpgrade {
    pub file: String,
    pub old_image: String,
    pub new_image: String,
}

#[derive(Error, Debug)]
pub enum PonosError {
    #[error("timed out after {timeout_ms}ms waiting for the session endpoint from {url}")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    #[error("tool server stream closed: {0}")]
    StreamClosed(String),

    #[error("request {id} ({method}) timed out after {timeout_ms}ms")]
    RequestTimeout {
        id: u64,
        method: String,
        timeout_ms: u64,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session {session_id} is no longer valid (HTTP {status})")]
    SessionExpired { session_id: String, status: u16 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("tool '{tool}' reported an error: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("unexpected response shape from {operation}: '{field}' not found")]
    UnexpectedShape {
        operation: &'static str,
        field: &'static str,
    },

    #[error("credential error: {0}")]
    Credential(String),

    #[error("rate limit exceeded; try again after {}", format_reset(.reset_at))]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("invalid argument '{field}': {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    #[error("manifest {file} could not be processed: {reason}")]
    Manifest { file: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

fn format_reset(reset_at: &Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(at) => at.to_rfc3339(),
        None => "an unknown reset time".to_string(),
    }
}

impl PonosError {
    /// Connection-level failures: the session may be dead and a fresh one can
    /// reasonably succeed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PonosError::ConnectTimeout { .. }
                | PonosError::StreamClosed(_)
                | PonosError::RequestTimeout { .. }
                | PonosError::Transport(_)
                | PonosError::SessionExpired { .. }
        )
    }

    /// Whether the tool façade may reconnect and try the call once more.
    pub fn is_retryable(&self) -> bool {
        self.is_transport()
    }
}

pub type Result<T> = std::result::Result<T, PonosError>;
