//! MCP client for a remote repository tool server reachable over SSE.
//!
//! Requests are POSTed to a session endpoint; replies arrive on one
//! long-lived event stream and are matched back to callers by id.

pub mod auth;
pub mod client;
pub mod config;
pub mod correlator;
pub mod passthrough;
pub mod rate_limit;
pub mod session;
pub mod tools;
pub mod transport;
pub mod types;

pub use auth::CredentialManager;
pub use client::{decode_tool_result, ToolClient};
pub use config::{CredentialConfig, McpClientConfig};
pub use correlator::{Correlator, Reply};
pub use session::{SessionManager, SessionSnapshot};
pub use transport::{normalize_server_url, resolve_endpoint, SessionEndpoint, StreamHandler};
pub use types::{ContentItem, Envelope, JsonRpcRequest, JsonRpcResponse, ToolCallResult};
