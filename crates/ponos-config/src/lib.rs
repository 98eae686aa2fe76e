use ponos_core::{PonosError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub mod env_substitution;

pub use env_substitution::substitute_env_vars;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PonosConfig {
    #[serde(default)]
    pub github: GitHubSettings,
    #[serde(default)]
    pub mcp: McpSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub projects: Vec<Project>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSettings {
    /// Pre-shared token; takes precedence over app credentials.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub installation_id: String,
    /// Inline PEM (literal `\n` allowed) or a path to a `.pem` file.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key: String,
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default = "default_mcp_url")]
    pub mcp_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

/// Timeouts for the tool-server client, in milliseconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_initialize_timeout")]
    pub initialize_timeout: u64,
    /// Seconds before expiry at which a delegated token is refreshed.
    #[serde(default = "default_refresh_buffer")]
    pub token_refresh_buffer_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// A repository holding node manifests for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub network: String,
    #[serde(default)]
    pub project_name: String,
    pub owner: String,
    pub name: String,
    /// Empty means `github.base_branch`.
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl PonosConfig {
    /// Load from a YAML file, then apply environment overrides.
    ///
    /// A missing file is not an error: defaults plus environment are used.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|e| {
                PonosError::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
            })?;
            Self::parse_yaml(&content)?
        } else {
            info!("No configuration file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config = Self::parse_yaml(yaml)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    fn parse_yaml(yaml: &str) -> Result<Self> {
        let mut raw: serde_json::Value = serde_yaml::from_str(yaml)
            .map_err(|e| PonosError::ConfigError(format!("Failed to parse YAML: {}", e)))?;
        if raw.is_null() {
            return Ok(Self::default());
        }
        substitute_env_vars(&mut raw)?;
        serde_json::from_value(raw)
            .map_err(|e| PonosError::ConfigError(format!("Invalid configuration: {}", e)))
    }

    /// Environment variables win over file values when set and non-empty.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GITHUB_TOKEN") {
            self.github.token = v;
        }
        if let Some(v) = get("GITHUB_APP_ID") {
            self.github.app_id = v;
        }
        if let Some(v) = get("GITHUB_INSTALL_ID") {
            self.github.installation_id = v;
        }
        if let Some(v) = get("GITHUB_PEM_KEY") {
            self.github.private_key = v;
        }
        if let Some(v) = get("GITHUB_BOT_NAME") {
            self.github.bot_name = v;
        }
        if let Some(v) = get("GITHUB_MCP_URL") {
            self.github.mcp_url = v;
        }
        if let Some(v) = get("PORT") {
            match v.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => debug!("Ignoring non-numeric PORT value '{}'", v),
            }
        }
    }

    fn sanitize(&mut self) {
        let gh = &mut self.github;
        for field in [
            &mut gh.token,
            &mut gh.app_id,
            &mut gh.installation_id,
            &mut gh.private_key,
            &mut gh.bot_name,
            &mut gh.mcp_url,
            &mut gh.api_url,
            &mut gh.base_branch,
        ] {
            trim_in_place(field);
        }

        for project in &mut self.projects {
            for field in [
                &mut project.network,
                &mut project.project_name,
                &mut project.owner,
                &mut project.name,
                &mut project.branch,
            ] {
                trim_in_place(field);
            }
            if project.branch.is_empty() {
                project.branch = self.github.base_branch.clone();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_github_auth()?;

        if self.mcp.connect_timeout == 0
            || self.mcp.request_timeout == 0
            || self.mcp.initialize_timeout == 0
        {
            return Err(PonosError::ConfigError("MCP timeouts must be greater than zero".into()));
        }
        // Refreshing earlier than the token's own lifetime would refresh on every call.
        if self.mcp.token_refresh_buffer_secs >= 3600 {
            return Err(PonosError::ConfigError(
                "token_refresh_buffer_secs must be shorter than the one-hour token lifetime".into(),
            ));
        }

        for project in &self.projects {
            if project.owner.is_empty() || project.name.is_empty() {
                return Err(PonosError::ConfigError(format!(
                    "Project for network '{}' needs both owner and name",
                    project.network
                )));
            }
        }
        Ok(())
    }

    fn validate_github_auth(&self) -> Result<()> {
        let gh = &self.github;
        if !gh.app_id.is_empty() || !gh.installation_id.is_empty() || !gh.private_key.is_empty() {
            if gh.app_id.is_empty() {
                return Err(PonosError::ConfigError(
                    "GITHUB_APP_ID is required when using GitHub App authentication".into(),
                ));
            }
            if gh.installation_id.is_empty() {
                return Err(PonosError::ConfigError(
                    "GITHUB_INSTALL_ID is required when using GitHub App authentication".into(),
                ));
            }
            if gh.private_key.is_empty() {
                return Err(PonosError::ConfigError(
                    "GITHUB_PEM_KEY is required when using GitHub App authentication".into(),
                ));
            }
            return Ok(());
        }

        if gh.token.is_empty() {
            return Err(PonosError::ConfigError(
                "either GitHub App credentials (GITHUB_APP_ID, GITHUB_INSTALL_ID, GITHUB_PEM_KEY) or GITHUB_TOKEN is required".into(),
            ));
        }
        Ok(())
    }

    /// Look a project up by project name or network, case-insensitively.
    pub fn find_project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| {
            p.project_name.eq_ignore_ascii_case(name) || p.network.eq_ignore_ascii_case(name)
        })
    }

    pub fn default_config_path() -> PathBuf {
        std::env::var("PONOS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ponos.yaml"))
    }
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            app_id: String::new(),
            installation_id: String::new(),
            private_key: String::new(),
            bot_name: default_bot_name(),
            mcp_url: default_mcp_url(),
            api_url: default_api_url(),
            base_branch: default_base_branch(),
        }
    }
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            initialize_timeout: default_initialize_timeout(),
            token_refresh_buffer_secs: default_refresh_buffer(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_bot_name() -> String { "ponos-bot".to_string() }
fn default_mcp_url() -> String { "http://localhost:3001".to_string() }
fn default_api_url() -> String { "https://api.github.com".to_string() }
fn default_base_branch() -> String { "main".to_string() }
fn default_connect_timeout() -> u64 { 10_000 }
fn default_request_timeout() -> u64 { 60_000 }
fn default_initialize_timeout() -> u64 { 30_000 }
fn default_refresh_buffer() -> u64 { 300 }
fn default_port() -> u16 { 8080 }

fn trim_in_place(field: &mut String) {
    let trimmed = field.trim();
    if trimmed.len() != field.len() {
        *field = trimmed.to_string();
    }
}
