use std::{
    env,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ApiSection;

/// Validity window applied when the auth response omits `expires_in`.
const DEFAULT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// An issued credential with its expiry. Reads compare `expires_at`
/// against the current instant before use.
#[derive(Debug, Clone)]
pub struct Session {
    pub credential: String,
    pub expires_at: Instant,
}

impl Session {
    pub fn is_valid(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Authentication failures. Surfaced to the caller and never retried
/// automatically; fatal to the current query only.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("API credentials missing: set {key_env} and {secret_env}")]
    MissingCredentials { key_env: String, secret_env: String },
    #[error("authentication rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("authentication transport failure: {0}")]
    Transport(String),
}

/// Credential-issuance response. Unknown fields are ignored; every field is
/// optional so partial responses fail with a clear error instead of a
/// deserialisation panic.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Seam over the credential-issuance exchange so orchestration can be
/// tested with stubs.
#[async_trait]
pub trait AuthExchange: Send + Sync {
    async fn issue_token(&self) -> Result<AuthResponse, AuthError>;
}

/// Thread-safe cache around one credential.
///
/// The exchange runs while the mutex is held, so concurrent callers that
/// observe an expired or missing credential coordinate on exactly one
/// outbound authentication call and all receive its result.
pub struct SessionCache {
    exchange: Arc<dyn AuthExchange>,
    inner: Mutex<Option<Session>>,
}

impl SessionCache {
    pub fn new(exchange: Arc<dyn AuthExchange>) -> Self {
        Self {
            exchange,
            inner: Mutex::new(None),
        }
    }

    /// Return the cached credential when its expiry is strictly in the
    /// future, otherwise run the exchange and cache the result.
    pub async fn ensure_authenticated(&self) -> Result<String, AuthError> {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_valid() {
                debug!("Using cached credential");
                return Ok(session.credential.clone());
            }
        }
        let session = self.issue().await?;
        let credential = session.credential.clone();
        *guard = Some(session);
        Ok(credential)
    }

    /// Drop the cached credential and re-run the exchange unconditionally.
    /// Used after a downstream call reports an authorization failure.
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        let mut guard = self.inner.lock().await;
        *guard = None;
        let session = self.issue().await?;
        let credential = session.credential.clone();
        *guard = Some(session);
        Ok(credential)
    }

    /// Snapshot of the cached session, if any.
    pub async fn current_session(&self) -> Option<Session> {
        self.inner.lock().await.clone()
    }

    async fn issue(&self) -> Result<Session, AuthError> {
        let response = self.exchange.issue_token().await?;
        let session = session_from_response(response)?;
        info!(
            valid_for_secs = (session.expires_at - Instant::now()).as_secs(),
            "Authentication successful"
        );
        Ok(session)
    }
}

fn session_from_response(response: AuthResponse) -> Result<Session, AuthError> {
    let credential = match response.access_token {
        Some(token) if !token.trim().is_empty() => token,
        _ => {
            return Err(AuthError::Rejected {
                status: 200,
                message: "response missing access_token".into(),
            });
        }
    };
    let validity = response
        .expires_in
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or(DEFAULT_VALIDITY);
    Ok(Session {
        credential,
        expires_at: Instant::now() + validity,
    })
}

/// Production exchange: `POST {base_url}/{version}/auth` with a JSON
/// `{api_key, api_secret}` body. Credentials come from the environment
/// variables named in the config rather than the config file itself.
pub struct HttpAuthExchange {
    client: reqwest::Client,
    auth_url: String,
    key_env: String,
    secret_env: String,
}

impl HttpAuthExchange {
    pub fn from_settings(api: &ApiSection) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("PhantomDNS/0.1")
            .timeout(AUTH_TIMEOUT)
            .build()
            .map_err(|err| anyhow::anyhow!("Failed to build auth HTTP client: {err}"))?;
        let auth_url = format!(
            "{}/{}/auth",
            api.base_url.trim_end_matches('/'),
            api.version.trim_matches('/')
        );
        Ok(Self {
            client,
            auth_url,
            key_env: api.api_key_env.clone(),
            secret_env: api.api_secret_env.clone(),
        })
    }
}

#[async_trait]
impl AuthExchange for HttpAuthExchange {
    async fn issue_token(&self) -> Result<AuthResponse, AuthError> {
        let api_key = env::var(&self.key_env).ok().filter(|v| !v.is_empty());
        let api_secret = env::var(&self.secret_env).ok().filter(|v| !v.is_empty());
        let (api_key, api_secret) = match (api_key, api_secret) {
            (Some(key), Some(secret)) => (key, secret),
            _ => {
                return Err(AuthError::MissingCredentials {
                    key_env: self.key_env.clone(),
                    secret_env: self.secret_env.clone(),
                });
            }
        };

        let response = self
            .client
            .post(&self.auth_url)
            .json(&json!({ "api_key": api_key, "api_secret": api_secret }))
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message: message.chars().take(256).collect(),
            });
        }

        response
            .json::<AuthResponse>()
            .await
            .map_err(|err| AuthError::Transport(format!("malformed auth response: {err}")))
    }
}
