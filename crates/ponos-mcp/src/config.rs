//! Client configuration derived from the application settings

use ponos_config::PonosConfig;
use std::time::Duration;

/// Reported as `clientInfo.version` during the handshake.
pub const CLIENT_VERSION: &str = "1.0.0";

/// Credentials used to sign stream and submission requests.
#[derive(Debug, Clone, Default)]
pub struct CredentialConfig {
    pub static_token: Option<String>,
    pub app_id: Option<String>,
    pub installation_id: Option<String>,
    /// Inline PEM or a path to one.
    pub private_key: Option<String>,
    pub api_url: String,
    pub refresh_buffer: Duration,
}

#[derive(Debug, Clone)]
pub struct McpClientConfig {
    /// Server URL as configured; normalized when the client is built.
    pub server_url: String,
    pub client_name: String,
    pub client_version: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub initialize_timeout: Duration,
    pub credentials: CredentialConfig,
}

impl McpClientConfig {
    pub fn from_config(config: &PonosConfig) -> Self {
        let gh = &config.github;
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Self {
            server_url: gh.mcp_url.clone(),
            client_name: gh.bot_name.clone(),
            client_version: CLIENT_VERSION.to_string(),
            connect_timeout: Duration::from_millis(config.mcp.connect_timeout),
            request_timeout: Duration::from_millis(config.mcp.request_timeout),
            initialize_timeout: Duration::from_millis(config.mcp.initialize_timeout),
            credentials: CredentialConfig {
                static_token: non_empty(&gh.token),
                app_id: non_empty(&gh.app_id),
                installation_id: non_empty(&gh.installation_id),
                private_key: non_empty(&gh.private_key),
                api_url: gh.api_url.clone(),
                refresh_buffer: Duration::from_secs(config.mcp.token_refresh_buffer_secs),
            },
        }
    }

    /// Value sent as `User-Agent` on every request.
    pub fn user_agent(&self) -> String {
        format!("{}/1.0", self.client_name)
    }
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self::from_config(&PonosConfig::default())
    }
}
