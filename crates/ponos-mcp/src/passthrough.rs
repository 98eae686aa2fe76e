//! Administrative JSON-RPC pass-through onto [`ToolClient::call_tool`]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::client::ToolClient;
use crate::types::{JsonRpcError, JSONRPC_VERSION};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const TOOL_EXECUTION_FAILED: i64 = -32000;

#[derive(Debug, Deserialize)]
struct PassthroughRequest {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Value,
}

/// Response body; `id` echoes the inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassthroughResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl PassthroughResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Map one inbound request body to an HTTP status and response body.
pub async fn handle(client: Option<&ToolClient>, body: &[u8]) -> (u16, PassthroughResponse) {
    let Some(client) = client else {
        error!("Tool client not available for pass-through request");
        return (
            503,
            PassthroughResponse::failure(Value::from(0), METHOD_NOT_FOUND, "tool client not available"),
        );
    };

    let request: PassthroughRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejecting unparsable pass-through request: {}", e);
            return (400, PassthroughResponse::failure(Value::Null, PARSE_ERROR, "Parse error"));
        }
    };
    let id = request.id;

    if request.method != "tools/call" {
        return (400, PassthroughResponse::failure(id, METHOD_NOT_FOUND, "Method not found"));
    }

    let Value::Object(mut params) = request.params else {
        return (400, PassthroughResponse::failure(id, INVALID_PARAMS, "Invalid params"));
    };

    let name = match params.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            return (400, PassthroughResponse::failure(id, INVALID_PARAMS, "Tool name required"))
        }
    };

    let arguments = match params.remove("arguments") {
        Some(Value::Object(arguments)) => Value::Object(arguments),
        _ => Value::Object(Map::new()),
    };

    match client.call_tool(&name, arguments).await {
        Ok(result) => (200, PassthroughResponse::success(id, result)),
        Err(e) => {
            error!("Pass-through tool call '{}' failed: {}", name, e);
            (
                200,
                PassthroughResponse::failure(
                    id,
                    TOOL_EXECUTION_FAILED,
                    format!("Tool execution failed: {}", e),
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpClientConfig;
    use serde_json::json;

    fn offline_client() -> ToolClient {
        let mut config = McpClientConfig::default();
        config.server_url = "http://127.0.0.1:9".to_string();
        ToolClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_unavailable_client() {
        let (status, response) = handle(None, b"{}").await;
        assert_eq!(status, 503);
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let client = offline_client();

        let (status, response) = handle(Some(&client), b"{not json").await;
        assert_eq!(status, 400);
        assert_eq!(response.error.unwrap().message, "Parse error");

        let body = json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}).to_string();
        let (status, response) = handle(Some(&client), body.as_bytes()).await;
        assert_eq!(status, 400);
        assert_eq!(response.id, json!(7));
        assert_eq!(response.error.unwrap().message, "Method not found");

        let body = json!({"id": "a", "method": "tools/call", "params": [1, 2]}).to_string();
        let (status, response) = handle(Some(&client), body.as_bytes()).await;
        assert_eq!(status, 400);
        assert_eq!(response.id, json!("a"));
        let error = response.error.unwrap();
        assert_eq!((error.code, error.message.as_str()), (INVALID_PARAMS, "Invalid params"));

        let body = json!({"id": 3, "method": "tools/call", "params": {"arguments": {}}}).to_string();
        let (status, response) = handle(Some(&client), body.as_bytes()).await;
        assert_eq!(status, 400);
        assert_eq!(response.error.unwrap().message, "Tool name required");

        // Nothing above should have tried to reach the server.
        assert_eq!(client.session().state_name(), "disconnected");
    }

    #[test]
    fn test_response_serialization_omits_empty_members() {
        let ok = serde_json::to_value(PassthroughResponse::success(json!(1), json!({"x": 1}))).unwrap();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 1, "result": {"x": 1}}));

        let err = serde_json::to_value(PassthroughResponse::failure(json!(2), PARSE_ERROR, "Parse error")).unwrap();
        assert_eq!(
            err,
            json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32700, "message": "Parse error"}})
        );
    }
}
