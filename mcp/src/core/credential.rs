//! Credential lifecycle: static bearer tokens and OAuth2 client credentials.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::RwLock;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    core::{
        config::{resolve_env, AuthConfig},
        metrics::McpMetrics,
    },
    error::{McpError, McpResult},
};

/// Credentials expiring within this margin are refreshed before use.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    StaticBearer,
    OAuth2ClientCredentials,
}

/// An issued access token. Replaced wholesale on refresh.
#[derive(Clone)]
pub struct Credential {
    token: String,
    expires_at: Option<Instant>,
    kind: CredentialKind,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: Option<Instant>, kind: CredentialKind) -> Self {
        Self {
            token: token.into(),
            expires_at,
            kind,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// True when the credential expires within [`REFRESH_MARGIN`] of `now`.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at.saturating_duration_since(now) < REFRESH_MARGIN)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"****")
            .field("expires_at", &self.expires_at)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Owns the current credential for one client instance.
///
/// Refreshes are single-flight: callers racing on an expiring credential wait
/// for one in-flight authentication and share its result.
pub struct CredentialManager {
    auth: AuthConfig,
    http: reqwest::Client,
    metrics: Arc<McpMetrics>,
    current: RwLock<Option<Arc<Credential>>>,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
    token_requests: AtomicU64,
}

impl CredentialManager {
    pub fn new(auth: AuthConfig, http: reqwest::Client, metrics: Arc<McpMetrics>) -> Self {
        Self {
            auth,
            http,
            metrics,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
            token_requests: AtomicU64::new(0),
        }
    }

    /// Obtain a fresh credential unconditionally.
    pub async fn authenticate(&self) -> McpResult<Arc<Credential>> {
        let _guard = self.refresh_lock.lock().await;
        self.authenticate_locked().await
    }

    /// Return a credential that is valid for at least [`REFRESH_MARGIN`],
    /// authenticating first when there is none or it is about to expire.
    pub async fn ensure_valid(&self) -> McpResult<Arc<Credential>> {
        if let Some(credential) = self.usable() {
            return Ok(credential);
        }

        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        // A concurrent caller refreshed while we waited
        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(credential) = self.current() {
                return Ok(credential);
            }
        }
        if let Some(credential) = self.usable() {
            return Ok(credential);
        }

        debug!("Credential missing or expiring, re-authenticating");
        self.authenticate_locked().await
    }

    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.read().is_some()
    }

    /// Drop the current credential.
    pub fn clear(&self) {
        *self.current.write() = None;
    }

    /// Token-endpoint requests issued so far.
    pub fn token_requests(&self) -> u64 {
        self.token_requests.load(Ordering::Relaxed)
    }

    fn usable(&self) -> Option<Arc<Credential>> {
        let now = Instant::now();
        self.current
            .read()
            .as_ref()
            .filter(|credential| !credential.needs_refresh(now))
            .cloned()
    }

    async fn authenticate_locked(&self) -> McpResult<Arc<Credential>> {
        match self.fetch().await {
            Ok(credential) => {
                let credential = Arc::new(credential);
                *self.current.write() = Some(Arc::clone(&credential));
                self.generation.fetch_add(1, Ordering::AcqRel);
                Ok(credential)
            }
            Err(e) => {
                if matches!(e, McpError::Auth(_)) {
                    self.metrics.record_authentication_failure();
                }
                warn!(auth_type = self.auth.kind(), error = %e, "Authentication failed");
                Err(e)
            }
        }
    }

    async fn fetch(&self) -> McpResult<Credential> {
        match &self.auth {
            AuthConfig::Bearer { token } => {
                let token = token
                    .as_deref()
                    .ok_or_else(|| McpError::Auth("bearer token is not configured".to_string()))?;
                let token = resolve_env(token)?;
                if token.is_empty() {
                    return Err(McpError::Auth("bearer token is empty".to_string()));
                }
                Ok(Credential::new(token, None, CredentialKind::StaticBearer))
            }
            AuthConfig::OAuth2 {
                token_endpoint,
                client_id,
                client_secret,
                required_scopes,
            } => {
                let endpoint = resolve_env(required(token_endpoint, "tokenEndpoint")?)?;
                let client_id = resolve_env(required(client_id, "clientId")?)?;
                let client_secret = resolve_env(required(client_secret, "clientSecret")?)?;
                self.request_token(&endpoint, &client_id, &client_secret, required_scopes)
                    .await
            }
        }
    }

    async fn request_token(
        &self,
        endpoint: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> McpResult<Credential> {
        self.token_requests.fetch_add(1, Ordering::Relaxed);

        let scope = scopes.join(" ");
        let mut form = vec![("grant_type", "client_credentials")];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .http
            .post(endpoint)
            .basic_auth(client_id, Some(client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| McpError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| McpError::Auth(format!("invalid token response: {}", e)))?;

        let expires_at = body
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        info!(
            expires_in = ?body.expires_in,
            "Obtained OAuth2 access token"
        );
        Ok(Credential::new(
            body.access_token,
            expires_at,
            CredentialKind::OAuth2ClientCredentials,
        ))
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> McpResult<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| McpError::Auth(format!("oauth2 {} is not configured", field)))
}
