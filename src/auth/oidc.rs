//! OIDC (OpenID Connect) authentication.
//!
//! This module implements the authorization code flow with PKCE:
//! - Discovery of provider endpoints, cached
//! - Authorization URLs carrying state, nonce and an S256 code challenge
//! - Code exchange and ID token validation
//!
//! Per-login state (nonce and PKCE verifier) is not stored server-side; the
//! route layer keeps it in a short-lived CSRF cookie.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use url::Url;

use super::{
    AuthError,
    jwt::{IdTokenClaims, IdTokenValidator},
};
use crate::config::OidcConfig;

/// Claims that describe the token rather than the user; not kept in sessions.
const PROTOCOL_CLAIMS: &[&str] = &[
    "iss", "aud", "azp", "iat", "nbf", "exp", "auth_time", "nonce", "at_hash", "c_hash", "sid",
    "jti",
];

/// OIDC discovery document.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcDiscovery {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Token response from the OIDC provider.
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Login state
// ─────────────────────────────────────────────────────────────────────────────

/// Nonce and PKCE verifier for one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginState {
    pub nonce: String,
    pub code_verifier: String,
}

impl LoginState {
    pub fn generate() -> Self {
        let mut nonce = [0u8; 16];
        let mut verifier = [0u8; 32];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut nonce);
        rng.fill_bytes(&mut verifier);
        Self {
            nonce: hex::encode(nonce),
            code_verifier: URL_SAFE_NO_PAD.encode(verifier),
        }
    }

    /// S256 code challenge for the verifier.
    pub fn code_challenge(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.code_verifier.as_bytes()))
    }

    /// `nonce.verifier`; neither part can contain a dot.
    pub fn to_cookie_value(&self) -> String {
        format!("{}.{}", self.nonce, self.code_verifier)
    }

    pub fn from_cookie_value(value: &str) -> Option<Self> {
        let (nonce, code_verifier) = value.split_once('.')?;
        if nonce.is_empty() || code_verifier.is_empty() {
            return None;
        }
        Some(Self {
            nonce: nonce.to_string(),
            code_verifier: code_verifier.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity provider capability
// ─────────────────────────────────────────────────────────────────────────────

/// A verified end-user identity, straight from the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    pub subject: String,
    pub claims: BTreeMap<String, serde_json::Value>,
    pub groups: Vec<String>,
    pub id_token: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider login URL for one attempt.
    async fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        login: &LoginState,
    ) -> Result<String, AuthError>;

    /// Redeem an authorization code and verify the resulting ID token.
    async fn verify_and_exchange(
        &self,
        code: &str,
        redirect_uri: &str,
        login: &LoginState,
    ) -> Result<VerifiedIdentity, AuthError>;
}

pub type SharedIdentityProvider = Arc<dyn IdentityProvider>;

// ─────────────────────────────────────────────────────────────────────────────
// OIDC authenticator
// ─────────────────────────────────────────────────────────────────────────────

struct CachedDiscovery {
    discovery: OidcDiscovery,
    fetched_at: Instant,
}

/// OIDC authenticator that handles the authorization code flow.
pub struct OidcAuthenticator {
    config: OidcConfig,
    http_client: reqwest::Client,
    discovery_cache: RwLock<Option<CachedDiscovery>>,
    validator: RwLock<Option<Arc<IdTokenValidator>>>,
}

impl OidcAuthenticator {
    pub fn new(config: OidcConfig) -> Result<Self, AuthError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .map_err(|e| AuthError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(config, http_client))
    }

    pub fn with_client(config: OidcConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
            discovery_cache: RwLock::new(None),
            validator: RwLock::new(None),
        }
    }

    /// Get the OIDC discovery document, fetching it if necessary.
    pub async fn get_discovery(&self) -> Result<OidcDiscovery, AuthError> {
        let max_age = Duration::from_secs(self.config.discovery_cache_secs);
        {
            let cache = self.discovery_cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < max_age
            {
                return Ok(cached.discovery.clone());
            }
        }

        let discovery_url = self.config.discovery_url();
        tracing::debug!(url = %discovery_url, "Fetching OIDC discovery document");

        let response = self
            .http_client
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %discovery_url, "Failed to fetch OIDC discovery");
                AuthError::Unavailable(format!("Failed to fetch OIDC discovery: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, "OIDC discovery endpoint returned error");
            return Err(AuthError::Unavailable(format!(
                "OIDC discovery returned {}",
                status
            )));
        }

        let discovery: OidcDiscovery = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse OIDC discovery");
            AuthError::Internal(format!("Failed to parse OIDC discovery: {}", e))
        })?;

        if discovery.issuer.trim_end_matches('/') != self.config.issuer_url.trim_end_matches('/') {
            tracing::warn!(
                configured = %self.config.issuer_url,
                discovered = %discovery.issuer,
                "Discovered issuer differs from configuration, using the discovered one"
            );
        }

        *self.discovery_cache.write().await = Some(CachedDiscovery {
            discovery: discovery.clone(),
            fetched_at: Instant::now(),
        });

        // Keep the validator (and its key cache) unless the key set moved.
        {
            let mut validator = self.validator.write().await;
            let stale = validator
                .as_ref()
                .is_none_or(|v| v.jwks_uri() != discovery.jwks_uri);
            if stale {
                *validator = Some(Arc::new(IdTokenValidator::new(
                    &discovery.issuer,
                    &self.config.client_id,
                    &discovery.jwks_uri,
                    max_age,
                    self.http_client.clone(),
                )));
            }
        }

        Ok(discovery)
    }

    async fn validator(&self) -> Result<Arc<IdTokenValidator>, AuthError> {
        self.get_discovery().await?;
        self.validator
            .read()
            .await
            .clone()
            .ok_or_else(|| AuthError::Internal("ID token validator not initialized".to_string()))
    }

    /// Build the session identity from validated claims.
    fn identity_from_claims(
        &self,
        claims: IdTokenClaims,
        id_token: String,
    ) -> Result<VerifiedIdentity, AuthError> {
        let IdTokenClaims { sub, mut extra, .. } = claims;

        if sub.is_empty() {
            tracing::warn!("ID token has an empty subject");
            return Err(AuthError::InvalidToken);
        }

        let groups = match extra.remove(&self.config.groups_claim) {
            Some(serde_json::Value::Array(values)) => values
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(serde_json::Value::String(group)) => vec![group],
            Some(other) => {
                tracing::warn!(
                    claim = %self.config.groups_claim,
                    kind = ?other,
                    "Groups claim is neither a string nor an array; ignoring"
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        if self.config.email_claim != "email"
            && let Some(email) = extra.remove(&self.config.email_claim)
        {
            extra.insert("email".to_string(), email);
        }
        for claim in PROTOCOL_CLAIMS {
            extra.remove(*claim);
        }

        Ok(VerifiedIdentity {
            subject: sub,
            claims: extra,
            groups,
            id_token,
        })
    }
}

#[async_trait]
impl IdentityProvider for OidcAuthenticator {
    async fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        login: &LoginState,
    ) -> Result<String, AuthError> {
        let discovery = self.get_discovery().await?;

        let mut url = Url::parse(&discovery.authorization_endpoint).map_err(|e| {
            AuthError::Internal(format!("Invalid authorization endpoint URL: {}", e))
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("nonce", &login.nonce)
            .append_pair("code_challenge", &login.code_challenge())
            .append_pair("code_challenge_method", "S256");

        Ok(url.to_string())
    }

    async fn verify_and_exchange(
        &self,
        code: &str,
        redirect_uri: &str,
        login: &LoginState,
    ) -> Result<VerifiedIdentity, AuthError> {
        let discovery = self.get_discovery().await?;

        let response = self
            .http_client
            .post(&discovery.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code_verifier", login.code_verifier.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to exchange code for tokens");
                AuthError::Unavailable(format!("Token exchange failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Token endpoint rejected the code");
            return Err(AuthError::InvalidToken);
        }

        let tokens: TokenResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse token response");
            AuthError::Internal(format!("Failed to parse token response: {}", e))
        })?;

        let id_token = tokens.id_token.ok_or_else(|| {
            tracing::error!("No ID token in response; is the openid scope granted?");
            AuthError::InvalidToken
        })?;

        let claims = self.validator().await?.validate(&id_token, &login.nonce).await?;
        let identity = self.identity_from_claims(claims, id_token)?;

        tracing::info!(
            subject = %identity.subject,
            groups = identity.groups.len(),
            "Verified identity"
        );
        Ok(identity)
    }
}
