//! Session storage in a remote key-value store, fronted by a local cache.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::RngCore;

use super::{
    CacheLookup, IdentityRecord, KeyValueStore, KvError, SessionCache, SessionError,
    SessionResult, SessionStore, codec, observe, token_hint,
};
use crate::config::ClusterStorageConfig;

/// Random bytes per session token (hex encoded in the cookie).
const TOKEN_BYTES: usize = 32;

/// Cluster-backed session store.
///
/// The cookie carries only an unguessable token; the record itself is held
/// remotely, so every replica of the service sees the same sessions. Reads go
/// through a per-process cache whose TTL is independent of record expiry.
pub struct ClusterSessionStore {
    remote: Arc<dyn KeyValueStore>,
    cache: SessionCache,
    remote_timeout: Duration,
}

impl ClusterSessionStore {
    pub fn new(
        remote: Arc<dyn KeyValueStore>,
        cache_ttl: Duration,
        max_cache_entries: usize,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            cache: SessionCache::new(cache_ttl, max_cache_entries),
            remote_timeout,
        }
    }

    pub fn from_config(remote: Arc<dyn KeyValueStore>, config: &ClusterStorageConfig) -> Self {
        Self::new(
            remote,
            config.cache_ttl(),
            config.max_cache_entries,
            config.remote_timeout(),
        )
    }

    /// Run a remote call under the store's timeout. Dropping the returned
    /// future (client went away) cancels the call.
    async fn remote_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, KvError>>,
    ) -> Result<T, KvError> {
        match tokio::time::timeout(self.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Unavailable(format!(
                "{operation} timed out after {}ms",
                self.remote_timeout.as_millis()
            ))),
        }
    }

    async fn save_inner(&self, record: &IdentityRecord) -> SessionResult<String> {
        let encoded = codec::encode(record)?;

        // A collision at 256 bits means a broken RNG; one retry is plenty.
        for _ in 0..2 {
            let token = generate_token();
            match self
                .remote_call("put", self.remote.put(&token, encoded.clone()))
                .await
            {
                Ok(()) => {
                    self.cache.insert(&token, record.clone());
                    tracing::debug!(
                        token = token_hint(&token),
                        subject = %record.subject,
                        partition = self.remote.partition(),
                        "Stored session"
                    );
                    return Ok(token);
                }
                Err(KvError::AlreadyExists(_)) => {
                    tracing::warn!(token = token_hint(&token), "Session token collision");
                }
                Err(e) => {
                    tracing::error!(
                        partition = self.remote.partition(),
                        error = %e,
                        "Failed to store session"
                    );
                    return Err(SessionError::StorageUnavailable(e.to_string()));
                }
            }
        }
        Err(SessionError::StorageUnavailable(
            "could not allocate a unique session token".into(),
        ))
    }

    async fn load_inner(&self, token: &str) -> SessionResult<IdentityRecord> {
        if !is_valid_token(token) {
            return Err(SessionError::Malformed("unrecognized session token".into()));
        }

        if let CacheLookup::Fresh(record) = self.cache.get(token) {
            if record.is_expired() {
                self.cache.invalidate(token);
                return Err(SessionError::Expired);
            }
            return Ok(record);
        }

        let bytes = self
            .remote_call("get", self.remote.get(token))
            .await
            .map_err(|e| {
                tracing::warn!(token = token_hint(token), error = %e, "Session lookup failed");
                SessionError::StorageUnavailable(e.to_string())
            })?;

        let Some(bytes) = bytes else {
            self.cache.invalidate(token);
            return Err(SessionError::NotFound);
        };

        match codec::decode(&bytes) {
            Ok(record) => {
                self.cache.insert(token, record.clone());
                Ok(record)
            }
            Err(e) => {
                self.cache.invalidate(token);
                Err(e.into())
            }
        }
    }

    async fn clear_inner(&self, token: &str) -> SessionResult<()> {
        self.cache.invalidate(token);
        if !is_valid_token(token) {
            return Ok(());
        }

        match self
            .remote_call("delete", self.remote.delete(token))
            .await
        {
            Ok(true) => {
                tracing::debug!(token = token_hint(token), "Deleted session");
            }
            Ok(false) => {
                tracing::debug!(token = token_hint(token), "Session already gone");
            }
            Err(e) => {
                // Left for the garbage collector once it expires.
                tracing::warn!(
                    token = token_hint(token),
                    error = %e,
                    "Failed to delete session"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for ClusterSessionStore {
    fn backend(&self) -> &'static str {
        "cluster"
    }

    async fn save(&self, record: &IdentityRecord) -> SessionResult<String> {
        let result = self.save_inner(record).await;
        observe(self.backend(), "save", &result);
        result
    }

    async fn load(&self, token: &str) -> SessionResult<IdentityRecord> {
        let result = self.load_inner(token).await;
        observe(self.backend(), "load", &result);
        result
    }

    async fn clear(&self, token: &str) -> SessionResult<()> {
        let result = self.clear_inner(token).await;
        observe(self.backend(), "clear", &result);
        result
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::session::MemoryKeyValueStore;

    /// Memory store with call counting, injected latency and outages.
    #[derive(Default)]
    struct TestRemote {
        inner: MemoryKeyValueStore,
        gets: AtomicUsize,
        get_delay: Option<Duration>,
        down: AtomicBool,
    }

    impl TestRemote {
        fn check(&self) -> Result<(), KvError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(KvError::Unavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyValueStore for TestRemote {
        fn partition(&self) -> &str {
            "test"
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
            self.check()?;
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.get_delay {
                tokio::time::sleep(delay).await;
            }
            self.check()?;
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool, KvError> {
            self.check()?;
            self.inner.delete(key).await
        }

        async fn list(&self) -> Result<Vec<(String, Vec<u8>)>, KvError> {
            self.check()?;
            self.inner.list().await
        }
    }

    fn record(valid_for: chrono::Duration) -> IdentityRecord {
        let now = Utc::now();
        let issued_at = (now + valid_for).min(now) - chrono::Duration::minutes(1);
        IdentityRecord {
            subject: "user-42".into(),
            claims: BTreeMap::from([("email".into(), json!("u42@example.com"))]),
            groups: vec!["viewers".into()],
            issued_at,
            expires_at: now + valid_for,
            id_token: None,
        }
    }

    fn store(remote: Arc<TestRemote>, cache_ttl: Duration) -> ClusterSessionStore {
        ClusterSessionStore::new(remote, cache_ttl, 1000, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_save_then_load_is_coherent_despite_slow_remote() {
        let remote = Arc::new(TestRemote {
            get_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let store = store(remote.clone(), Duration::from_secs(60));
        let original = record(chrono::Duration::hours(1));

        let token = store.save(&original).await.unwrap();
        assert_eq!(token.len(), 64);
        assert!(remote.inner.contains(&token).await);

        let loaded = store.load(&token).await.unwrap();
        assert_eq!(loaded, original);
        assert_eq!(remote.gets.load(Ordering::SeqCst), 0, "served from cache");
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let store = store(Arc::new(TestRemote::default()), Duration::from_secs(60));
        let r = record(chrono::Duration::hours(1));
        let a = store.save(&r).await.unwrap();
        let b = store.save(&r).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_expired_record_in_cache_is_expired() {
        let remote = Arc::new(TestRemote::default());
        let store = store(remote.clone(), Duration::from_secs(60));

        let token = store.save(&record(-chrono::Duration::seconds(5))).await.unwrap();

        assert!(matches!(store.load(&token).await, Err(SessionError::Expired)));
        assert_eq!(remote.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_entry_refreshed_from_remote() {
        let remote = Arc::new(TestRemote::default());
        let store = store(remote.clone(), Duration::ZERO);
        let original = record(chrono::Duration::hours(1));

        let token = store.save(&original).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.load(&token).await.unwrap(), original);
        assert_eq!(remote.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_deletion_is_not_found_after_ttl() {
        let remote = Arc::new(TestRemote::default());
        let store = store(remote.clone(), Duration::ZERO);

        let token = store.save(&record(chrono::Duration::hours(1))).await.unwrap();
        remote.inner.delete(&token).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(matches!(store.load(&token).await, Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn test_unknown_token_not_found() {
        let store = store(Arc::new(TestRemote::default()), Duration::from_secs(60));
        let token = generate_token();
        assert!(matches!(store.load(&token).await, Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn test_bad_token_format_is_malformed() {
        let store = store(Arc::new(TestRemote::default()), Duration::from_secs(60));
        let non_hex = "Z".repeat(64);
        let upper = "A".repeat(64);
        for token in ["", "abc", non_hex.as_str(), upper.as_str()] {
            assert!(
                matches!(store.load(token).await, Err(SessionError::Malformed(_))),
                "{token:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let remote = Arc::new(TestRemote::default());
        let store = store(remote.clone(), Duration::from_secs(60));

        let token = store.save(&record(chrono::Duration::hours(1))).await.unwrap();
        store.clear(&token).await.unwrap();
        store.clear(&token).await.unwrap();
        store.clear(&generate_token()).await.unwrap();
        store.clear("not-a-token").await.unwrap();

        assert!(!remote.inner.contains(&token).await);
        assert!(matches!(store.load(&token).await, Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn test_outage_is_storage_unavailable() {
        let remote = Arc::new(TestRemote::default());
        let store = store(remote.clone(), Duration::from_secs(60));
        remote.down.store(true, Ordering::SeqCst);

        assert!(matches!(
            store.save(&record(chrono::Duration::hours(1))).await,
            Err(SessionError::StorageUnavailable(_))
        ));
        assert!(matches!(
            store.load(&generate_token()).await,
            Err(SessionError::StorageUnavailable(_))
        ));
        // Clearing stays best-effort.
        store.clear(&generate_token()).await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_remote_times_out() {
        let remote = Arc::new(TestRemote {
            get_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let store = store(remote, Duration::from_secs(60));

        let started = std::time::Instant::now();
        let result = store.load(&generate_token()).await;

        assert!(matches!(
            result,
            Err(SessionError::StorageUnavailable(msg)) if msg.contains("timed out")
        ));
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
