//! Tool client: generic `tools/call` with one reconnect-and-retry

use ponos_config::PonosConfig;
use ponos_core::{PonosError, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::CredentialManager;
use crate::config::McpClientConfig;
use crate::session::{SessionManager, SessionSnapshot};
use crate::transport::SseTransport;
use crate::types::{ClientInfo, JsonRpcRequest, ToolCallParams, ToolCallResult};

#[derive(Debug)]
pub struct ToolClient {
    session: SessionManager,
    credentials: Arc<CredentialManager>,
}

impl ToolClient {
    pub fn new(config: McpClientConfig) -> Result<Self> {
        // No total timeout: it would also bound the long-lived stream.
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| PonosError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        let credentials = Arc::new(CredentialManager::new(&config.credentials, http.clone()));
        let transport = SseTransport::new(
            http,
            &config.server_url,
            config.connect_timeout,
            config.request_timeout,
        );
        info!(
            "Tool server client for {} (auth: {})",
            transport.stream_url(),
            credentials.mode_name()
        );

        let session = SessionManager::new(
            transport,
            credentials.clone(),
            ClientInfo {
                name: config.client_name.clone(),
                version: config.client_version.clone(),
            },
            config.request_timeout,
            config.initialize_timeout,
        );

        Ok(Self {
            session,
            credentials,
        })
    }

    pub fn from_config(config: &PonosConfig) -> Result<Self> {
        Self::new(McpClientConfig::from_config(config))
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    /// Connect now instead of on the first call.
    pub async fn connect(&self) -> Result<SessionSnapshot> {
        self.session.ensure_connected().await
    }

    pub fn close(&self) {
        self.session.disconnect("client closed");
    }

    /// Invoke a tool and return the raw `result` member.
    ///
    /// A transport failure forces one reconnect and a single retry; the
    /// second failure is returned as is.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if name.trim().is_empty() {
            return Err(PonosError::InvalidArgument {
                field: "name",
                reason: "tool name must not be empty".into(),
            });
        }
        let arguments = match arguments {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let mut generation = None;
        match self.call_tool_once(name, &arguments, &mut generation).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() => {
                warn!("Tool call '{}' failed, reconnecting: {}", name, e);
            }
            Err(e) => return Err(e),
        }

        self.session.reconnect_from(generation).await?;
        self.call_tool_once(name, &arguments, &mut generation).await
    }

    /// [`call_tool`](Self::call_tool) plus the first decode stage: the
    /// outer `{content, isError}` shape, with tool-reported errors surfaced.
    pub async fn call_tool_decoded(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let raw = self.call_tool(name, arguments).await?;
        decode_tool_result(name, raw)
    }

    async fn call_tool_once(
        &self,
        name: &str,
        arguments: &Value,
        generation: &mut Option<u64>,
    ) -> Result<Value> {
        let session = self.session.ensure_connected().await?;
        *generation = Some(session.generation);

        debug!("Calling tool '{}' on session generation {}", name, session.generation);
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: arguments.clone(),
        };
        let request = JsonRpcRequest::new("tools/call", Some(serde_json::to_value(params)?));

        self.session
            .request_on(&session, request)
            .await?
            .into_result()
    }
}

/// First decode stage of a `tools/call` result.
pub fn decode_tool_result(tool: &str, raw: Value) -> Result<ToolCallResult> {
    let result: ToolCallResult = serde_json::from_value(raw).map_err(|e| {
        PonosError::Protocol(format!("tool '{}' returned a malformed result: {}", tool, e))
    })?;

    if result.is_error.unwrap_or(false) {
        let message = result.joined_text();
        return Err(PonosError::ToolFailed {
            tool: tool.to_string(),
            message: if message.is_empty() {
                "no error details".to_string()
            } else {
                message
            },
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_tool_error() {
        let err = decode_tool_result(
            "create_branch",
            json!({"content": [{"type": "text", "text": "Reference already exists"}], "isError": true}),
        )
        .unwrap_err();
        match err {
            PonosError::ToolFailed { tool, message } => {
                assert_eq!(tool, "create_branch");
                assert_eq!(message, "Reference already exists");
            }
            other => panic!("expected tool failure, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_non_object_result() {
        let err = decode_tool_result("push_files", json!("plain string")).unwrap_err();
        assert!(matches!(err, PonosError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_empty_tool_name_is_rejected_without_connecting() {
        let mut config = McpClientConfig::default();
        config.server_url = "http://127.0.0.1:9".to_string();
        let client = ToolClient::new(config).unwrap();

        let err = client.call_tool("  ", json!({})).await.unwrap_err();
        assert!(matches!(err, PonosError::InvalidArgument { field: "name", .. }));
        assert_eq!(client.session().state_name(), "disconnected");
    }
}
