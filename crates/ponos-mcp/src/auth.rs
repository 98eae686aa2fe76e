//! Bearer credentials for the tool server
//!
//! Either a pre-shared token, or a GitHub App installation token obtained by
//! exchanging a signed RS256 assertion and cached until shortly before it
//! expires.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ponos_core::{PonosError, Result};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::CredentialConfig;
use crate::rate_limit;

/// Lifetime of the signed assertion; the exchange endpoint rejects longer ones.
const ASSERTION_TTL_SECS: i64 = 600;

/// Assumed lifetime when the exchange response carries no usable expiry.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

enum AuthMode {
    Static(SecretString),
    App {
        app_id: String,
        installation_id: String,
        private_key: SecretString,
    },
    Unconfigured,
}

struct CachedToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

pub struct CredentialManager {
    mode: AuthMode,
    http: reqwest::Client,
    api_url: String,
    refresh_buffer: ChronoDuration,
    cache: Mutex<Option<CachedToken>>,
    mode_logged: AtomicBool,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("mode", &self.mode_name())
            .field("api_url", &self.api_url)
            .finish()
    }
}

impl CredentialManager {
    pub fn new(config: &CredentialConfig, http: reqwest::Client) -> Self {
        let mode = match (
            &config.static_token,
            &config.app_id,
            &config.installation_id,
            &config.private_key,
        ) {
            (Some(token), _, _, _) => AuthMode::Static(Secret::new(token.clone())),
            (None, Some(app_id), Some(installation_id), Some(private_key)) => AuthMode::App {
                app_id: app_id.clone(),
                installation_id: installation_id.clone(),
                private_key: Secret::new(private_key.clone()),
            },
            _ => AuthMode::Unconfigured,
        };

        Self {
            mode,
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            refresh_buffer: to_chrono(config.refresh_buffer),
            cache: Mutex::new(None),
            mode_logged: AtomicBool::new(false),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            AuthMode::Static(_) => "static token",
            AuthMode::App { .. } => "GitHub App",
            AuthMode::Unconfigured => "none",
        }
    }

    /// Current bearer token, refreshing the delegated one when needed.
    pub async fn access_token(&self) -> Result<SecretString> {
        self.log_mode_once();

        let (app_id, installation_id, private_key) = match &self.mode {
            AuthMode::Static(token) => return Ok(Secret::new(token.expose_secret().clone())),
            AuthMode::App {
                app_id,
                installation_id,
                private_key,
            } => (app_id, installation_id, private_key),
            AuthMode::Unconfigured => {
                return Err(PonosError::Credential(
                    "no GitHub token or GitHub App credentials configured".into(),
                ))
            }
        };

        if let Some(token) = self.cached(Utc::now()) {
            return Ok(token);
        }

        let assertion = sign_assertion(app_id, private_key, Utc::now()).await?;
        let fresh = self.exchange(installation_id, &assertion).await?;
        let token = Secret::new(fresh.token.expose_secret().clone());

        debug!("Installation token refreshed; expires at {}", fresh.expires_at.to_rfc3339());
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(fresh);
        Ok(token)
    }

    fn cached(&self, now: DateTime<Utc>) -> Option<SecretString> {
        let guard = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|cached| now < cached.expires_at - self.refresh_buffer)
            .map(|cached| Secret::new(cached.token.expose_secret().clone()))
    }

    async fn exchange(&self, installation_id: &str, assertion: &str) -> Result<CachedToken> {
        #[derive(Debug, Deserialize)]
        struct InstallationTokenResponse {
            token: String,
            #[serde(default)]
            expires_at: Option<String>,
        }

        let endpoint = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );
        let requested_at = Utc::now();

        let response = self
            .http
            .post(&endpoint)
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(assertion)
            .send()
            .await
            .map_err(|e| PonosError::Credential(format!("token exchange request failed: {}", e)))?;

        let status = response.status();
        if let Some(err) = rate_limit::check_response(status, response.headers()) {
            return Err(err);
        }
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(PonosError::Credential(format!(
                "token exchange failed with status {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let payload: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|e| PonosError::Credential(format!("invalid token exchange response: {}", e)))?;

        let expires_at = payload
            .expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(|| requested_at + ChronoDuration::seconds(DEFAULT_TOKEN_TTL_SECS));

        Ok(CachedToken {
            token: Secret::new(payload.token),
            expires_at,
        })
    }

    fn log_mode_once(&self) {
        if self.mode_logged.swap(true, Ordering::Relaxed) {
            return;
        }
        match &self.mode {
            AuthMode::App { app_id, .. } => {
                info!("Authenticating to the tool server as GitHub App {}", app_id)
            }
            _ => info!("Authenticating to the tool server with {}", self.mode_name()),
        }
    }
}

/// Sign the short-lived app assertion used for the token exchange.
async fn sign_assertion(
    app_id: &str,
    private_key: &SecretString,
    now: DateTime<Utc>,
) -> Result<String> {
    #[derive(Debug, Serialize)]
    struct Claims<'a> {
        iss: &'a str,
        iat: i64,
        exp: i64,
    }

    let pem = load_private_key(private_key.expose_secret()).await?;
    let key = EncodingKey::from_rsa_pem(pem.expose_secret().as_bytes())
        .map_err(|e| PonosError::Credential(format!("invalid private key: {}", e)))?;

    let claims = Claims {
        iss: app_id,
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_TTL_SECS,
    };

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| PonosError::Credential(format!("failed to sign app assertion: {}", e)))
}

/// Paths start with `/` or `./` or end in `.pem`; anything else is inline PEM
/// whose newlines may arrive escaped as a literal `\n`.
pub(crate) fn is_key_path(value: &str) -> bool {
    value.starts_with('/') || value.starts_with("./") || value.ends_with(".pem")
}

pub(crate) async fn load_private_key(value: &str) -> Result<SecretString> {
    if is_key_path(value) {
        let path = Path::new(value);
        let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
            PonosError::Credential(format!(
                "failed to read private key {}: {}",
                path.display(),
                e
            ))
        })?;
        return Ok(Secret::new(pem));
    }
    Ok(Secret::new(value.replace("\\n", "\n")))
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(300))
}
