//! Cookie-backed session storage.
//!
//! The encoded record is encrypted with AES-256-GCM and then signed with
//! HMAC-SHA256 under an independent key. The cookie name is bound into both
//! the AEAD associated data and the MAC, so a value cannot be replayed under
//! a different cookie.
//!
//! Wire format (base64url, unpadded): `nonce(12) || ciphertext || mac(32)`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload, rand_core::RngCore},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{IdentityRecord, SessionError, SessionResult, SessionStore, codec, observe};
use crate::config::{ConfigError, CookieConfig, CookieStorageConfig};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// Authenticated encryption for cookie values.
struct CookieSealer {
    cipher: Aes256Gcm,
    auth_key: Vec<u8>,
    context: String,
}

impl CookieSealer {
    fn new(context: &str, auth_key: &[u8], encryption_key: &[u8]) -> Self {
        let digest = Sha256::digest(encryption_key);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new((&key).into()),
            auth_key: auth_key.to_vec(),
            context: context.to_string(),
        }
    }

    fn mac(&self, sealed: &[u8]) -> SessionResult<[u8; MAC_LEN]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.auth_key)
            .map_err(|e| SessionError::Malformed(format!("auth key: {e}")))?;
        mac.update(self.context.as_bytes());
        mac.update(&[0]);
        mac.update(sealed);
        let mut tag = [0u8; MAC_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }

    fn seal(&self, plaintext: &[u8]) -> SessionResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: self.context.as_bytes(),
                },
            )
            .map_err(|_| SessionError::Malformed("failed to encrypt session".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len() + MAC_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        let tag = self.mac(&out)?;
        out.extend_from_slice(&tag);

        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    fn open(&self, value: &str) -> SessionResult<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|_| SessionError::Malformed("cookie is not valid base64".into()))?;

        if raw.len() < NONCE_LEN + GCM_TAG_LEN + MAC_LEN {
            return Err(SessionError::Malformed("cookie is truncated".into()));
        }

        let (sealed, tag) = raw.split_at(raw.len() - MAC_LEN);
        let expected = self.mac(sealed)?;
        if !bool::from(expected.ct_eq(tag)) {
            return Err(SessionError::Malformed("cookie signature mismatch".into()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: self.context.as_bytes(),
                },
            )
            .map_err(|_| SessionError::Malformed("cookie could not be decrypted".into()))
    }
}

/// Session store whose token is the sealed record itself.
pub struct CookieSessionStore {
    sealer: CookieSealer,
    cookie_name: String,
    max_cookie_bytes: usize,
}

impl CookieSessionStore {
    pub fn new(
        cookie_name: &str,
        auth_key: &[u8],
        encryption_key: &[u8],
        max_cookie_bytes: usize,
    ) -> Self {
        Self {
            sealer: CookieSealer::new(cookie_name, auth_key, encryption_key),
            cookie_name: cookie_name.to_string(),
            max_cookie_bytes,
        }
    }

    pub fn from_config(
        cookie: &CookieConfig,
        storage: &CookieStorageConfig,
    ) -> Result<Self, ConfigError> {
        let encryption_key = cookie
            .encryption_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ConfigError::Validation("cookie.encryption_key is required".into())
            })?;
        Ok(Self::new(
            &cookie.name,
            cookie.secret.as_bytes(),
            encryption_key.as_bytes(),
            storage.max_cookie_bytes,
        ))
    }

    fn save_inner(&self, record: &IdentityRecord) -> SessionResult<String> {
        let encoded = codec::encode(record)?;
        let value = self.sealer.seal(&encoded)?;

        // name=value is what browsers count against the limit.
        let size = self.cookie_name.len() + 1 + value.len();
        if size > self.max_cookie_bytes {
            tracing::warn!(
                subject = %record.subject,
                size,
                limit = self.max_cookie_bytes,
                groups = record.groups.len(),
                "Session does not fit in a cookie; consider the cluster session backend"
            );
            return Err(SessionError::TooLarge {
                size,
                limit: self.max_cookie_bytes,
            });
        }
        Ok(value)
    }

    fn load_inner(&self, token: &str) -> SessionResult<IdentityRecord> {
        if token.is_empty() {
            return Err(SessionError::NotFound);
        }
        let plaintext = self.sealer.open(token)?;
        Ok(codec::decode(&plaintext)?)
    }
}

#[async_trait]
impl SessionStore for CookieSessionStore {
    fn backend(&self) -> &'static str {
        "cookie"
    }

    async fn save(&self, record: &IdentityRecord) -> SessionResult<String> {
        let result = self.save_inner(record);
        observe(self.backend(), "save", &result);
        result
    }

    async fn load(&self, token: &str) -> SessionResult<IdentityRecord> {
        let result = self.load_inner(token);
        if let Err(e) = &result {
            tracing::debug!(error = %e, "Rejected session cookie");
        }
        observe(self.backend(), "load", &result);
        result
    }

    async fn clear(&self, _token: &str) -> SessionResult<()> {
        // Nothing is held server-side; the handler expires the cookie.
        observe::<()>(self.backend(), "clear", &Ok(()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::*;

    const AUTH_KEY: &[u8] = b"0123456789abcdef0123456789abcdef";
    const ENC_KEY: &[u8] = b"fedcba9876543210fedcba9876543210";

    fn store() -> CookieSessionStore {
        CookieSessionStore::new("_forward_auth", AUTH_KEY, ENC_KEY, 4096)
    }

    fn record(groups: usize) -> IdentityRecord {
        let now = Utc::now();
        IdentityRecord {
            subject: "user-1".into(),
            claims: BTreeMap::from([("email".into(), json!("user@example.com"))]),
            groups: (0..groups).map(|i| format!("group-{i:04}")).collect(),
            issued_at: now,
            expires_at: now + Duration::hours(1),
            id_token: None,
        }
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let store = store();
        let original = record(3);

        let token = store.save(&original).await.unwrap();
        assert!(!token.contains("user@example.com"));

        let loaded = store.load(&token).await.unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_oversized_record_is_too_large() {
        let store = store();
        let result = store.save(&record(400)).await;

        match result {
            Err(SessionError::TooLarge { size, limit }) => {
                assert_eq!(limit, 4096);
                assert!(size > limit);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tampered_cookie_is_malformed() {
        let store = store();
        let token = store.save(&record(1)).await.unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        raw[NONCE_LEN + 2] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);

        assert!(matches!(
            store.load(&tampered).await,
            Err(SessionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_keys_rejected() {
        let token = store().save(&record(1)).await.unwrap();

        let other_auth =
            CookieSessionStore::new("_forward_auth", b"another-auth-key", ENC_KEY, 4096);
        assert!(matches!(
            other_auth.load(&token).await,
            Err(SessionError::Malformed(_))
        ));

        let other_name = CookieSessionStore::new("_other_cookie", AUTH_KEY, ENC_KEY, 4096);
        assert!(matches!(
            other_name.load(&token).await,
            Err(SessionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_record_rejected() {
        let store = store();
        let mut expired = record(1);
        expired.issued_at = Utc::now() - Duration::hours(3);
        expired.expires_at = Utc::now() - Duration::hours(1);

        let token = store.save(&expired).await.unwrap();
        assert!(matches!(store.load(&token).await, Err(SessionError::Expired)));
    }

    #[tokio::test]
    async fn test_garbage_and_empty_tokens() {
        let store = store();
        assert!(matches!(store.load("").await, Err(SessionError::NotFound)));
        assert!(matches!(
            store.load("not base64!").await,
            Err(SessionError::Malformed(_))
        ));
        assert!(matches!(
            store.load("c2hvcnQ").await,
            Err(SessionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = store();
        store.clear("anything").await.unwrap();
        store.clear("anything").await.unwrap();
    }
}
