//! ID token validation with JWKS support.
//!
//! Keys are fetched from the provider's `jwks_uri` and cached. An unknown key
//! ID triggers one refresh, which covers provider key rotation.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use jsonwebtoken::{
    Algorithm, DecodingKey, TokenData, Validation, decode, decode_header,
    jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm},
};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::AuthError;

/// Asymmetric algorithms accepted on ID tokens. Symmetric algorithms are
/// never accepted.
const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Claims from a validated ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    /// Subject (identity ID)
    pub sub: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    #[serde(default)]
    pub nonce: Option<String>,

    /// Every other claim, including `iss`, `aud` and `iat`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Cached JWKS with expiration.
struct CachedJwks {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// Validates ID tokens issued to one client.
pub struct IdTokenValidator {
    issuer: String,
    client_id: String,
    jwks_uri: String,
    refresh_after: Duration,
    http_client: reqwest::Client,
    jwks_cache: RwLock<Option<CachedJwks>>,
}

impl IdTokenValidator {
    pub fn new(
        issuer: &str,
        client_id: &str,
        jwks_uri: &str,
        refresh_after: Duration,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            jwks_uri: jwks_uri.to_string(),
            refresh_after,
            http_client,
            jwks_cache: RwLock::new(None),
        }
    }

    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Validate signature, issuer, audience and expiry, then the nonce.
    pub async fn validate(
        &self,
        token: &str,
        expected_nonce: &str,
    ) -> Result<IdTokenClaims, AuthError> {
        let header = decode_header(token).map_err(|e| {
            tracing::debug!(error = %e, "Failed to decode ID token header");
            AuthError::InvalidToken
        })?;

        // Rejects `none` and HMAC algorithms keyed with a public key.
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            tracing::warn!(algorithm = ?header.alg, "ID token algorithm not allowed");
            return Err(AuthError::InvalidToken);
        }

        let kid = header.kid.as_deref().ok_or_else(|| {
            tracing::debug!("ID token missing key ID (kid)");
            AuthError::InvalidToken
        })?;
        let decoding_key = self.get_decoding_key(kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.client_id]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        let TokenData { claims, .. } = decode::<IdTokenClaims>(token, &decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "ID token validation failed");
                AuthError::InvalidToken
            })?;

        if claims.nonce.as_deref() != Some(expected_nonce) {
            tracing::warn!(subject = %claims.sub, "ID token nonce mismatch");
            return Err(AuthError::InvalidToken);
        }

        Ok(claims)
    }

    async fn get_decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.refresh_after
                && let Some(key) = cached.keys.get(kid)
            {
                return Ok(key.clone());
            }
        }

        // Cache miss, expired, or a rotated key
        self.refresh_jwks().await?;

        let cache = self.jwks_cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
            .ok_or_else(|| {
                tracing::warn!(kid = kid, "Key ID not found in JWKS");
                AuthError::InvalidToken
            })
    }

    async fn refresh_jwks(&self) -> Result<(), AuthError> {
        tracing::debug!(url = %self.jwks_uri, "Fetching JWKS");

        let response = self
            .http_client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %self.jwks_uri, "Failed to fetch JWKS");
                AuthError::Unavailable(format!("Failed to fetch JWKS: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, url = %self.jwks_uri, "JWKS endpoint returned error");
            return Err(AuthError::Unavailable(format!(
                "JWKS endpoint returned {}",
                status
            )));
        }

        let jwks: JwkSet = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse JWKS response");
            AuthError::Internal(format!("Failed to parse JWKS: {}", e))
        })?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(kid) = &jwk.common.key_id {
                match jwk_to_decoding_key(&jwk) {
                    Ok(key) => {
                        keys.insert(kid.clone(), key);
                    }
                    Err(e) => {
                        tracing::warn!(kid = kid, error = %e, "Skipping unusable JWK");
                    }
                }
            }
        }

        tracing::info!(keys_count = keys.len(), "JWKS refreshed");

        *self.jwks_cache.write().await = Some(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, AuthError> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .map_err(|e| AuthError::Internal(format!("Failed to create RSA decoding key: {}", e))),
        AlgorithmParameters::EllipticCurve(ec) => match jwk.common.key_algorithm {
            Some(KeyAlgorithm::ES256) | Some(KeyAlgorithm::ES384) | None => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).map_err(|e| {
                    AuthError::Internal(format!("Failed to create EC decoding key: {}", e))
                })
            }
            Some(alg) => Err(AuthError::Internal(format!(
                "Unsupported EC algorithm: {alg:?}"
            ))),
        },
        _ => Err(AuthError::Internal(
            "Unsupported JWK algorithm type".to_string(),
        )),
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::{test_support::*, *};

    const ISSUER: &str = "https://idp.example.com";

    async fn validator() -> (MockServer, IdTokenValidator) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks()))
            .expect(1)
            .mount(&server)
            .await;
        let validator = IdTokenValidator::new(
            ISSUER,
            "forward-auth",
            &format!("{}/jwks", server.uri()),
            Duration::from_secs(3600),
            reqwest::Client::new(),
        );
        (server, validator)
    }

    #[tokio::test]
    async fn test_valid_token_and_key_caching() {
        let (_server, validator) = validator().await;
        let token = sign(&claims(ISSUER, "forward-auth", "n-1"));

        let claims = validator.validate(&token, "n-1").await.unwrap();
        assert_eq!(claims.sub, "user-7");
        assert_eq!(claims.extra["email"], json!("dev@corp.com"));

        // Second validation hits the cached key (mock expects one fetch).
        validator.validate(&token, "n-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_nonce_mismatch_rejected() {
        let (_server, validator) = validator().await;
        let token = sign(&claims(ISSUER, "forward-auth", "n-1"));
        assert!(matches!(
            validator.validate(&token, "n-2").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_wrong_audience_and_issuer_rejected() {
        let (_server, validator) = validator().await;

        let token = sign(&claims(ISSUER, "someone-else", "n"));
        assert!(matches!(validator.validate(&token, "n").await, Err(AuthError::InvalidToken)));

        let token = sign(&claims("https://evil.example.com", "forward-auth", "n"));
        assert!(matches!(validator.validate(&token, "n").await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (_server, validator) = validator().await;
        let mut expired = claims(ISSUER, "forward-auth", "n");
        expired["exp"] = json!(chrono::Utc::now().timestamp() - 3600);

        assert!(matches!(
            validator.validate(&sign(&expired), "n").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_hmac_token_rejected_before_key_lookup() {
        let validator = IdTokenValidator::new(
            ISSUER,
            "forward-auth",
            "http://127.0.0.1:9/jwks",
            Duration::from_secs(3600),
            reqwest::Client::new(),
        );
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &claims(ISSUER, "forward-auth", "n"),
            &jsonwebtoken::EncodingKey::from_secret(b"guess"),
        )
        .unwrap();

        assert!(matches!(validator.validate(&token, "n").await, Err(AuthError::InvalidToken)));
    }
}
