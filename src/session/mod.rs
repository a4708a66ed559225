//! Session storage.
//!
//! A verified identity is persisted between requests by one of two backends,
//! chosen once at startup:
//!
//! - [`CookieSessionStore`]: the encoded record, encrypted and signed, is the
//!   cookie value itself.
//! - [`ClusterSessionStore`]: the record lives in a remote key-value store
//!   (Kubernetes Secrets) under a random token; the cookie carries only the
//!   token. A [`GarbageCollector`] removes expired objects.
//!
//! Both expose the same [`SessionStore`] capability.

mod cache;
mod cluster;
pub mod codec;
mod cookie;
mod gc;
mod kv;

use std::sync::Arc;

use async_trait::async_trait;
pub use cache::{CacheLookup, SessionCache};
pub use cluster::ClusterSessionStore;
pub use codec::{CodecError, IdentityRecord};
pub use cookie::CookieSessionStore;
pub use gc::{GarbageCollector, GcCycleReport, GcError, GcHandle, SupervisedGc};
#[cfg(feature = "kubernetes")]
pub use kv::KubeSecretStore;
pub use kv::{KeyValueStore, KvError, MemoryKeyValueStore};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session lookup and persistence failures.
///
/// `NotFound`, `Malformed` and `Expired` mean "no usable session": the caller
/// should start authentication again. `StorageUnavailable` is an outage and
/// must never be treated as a missing session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Session malformed: {0}")]
    Malformed(String),

    #[error("Session expired")]
    Expired,

    #[error("Session too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Session storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl SessionError {
    /// Whether the caller should treat this as "no session" and re-authenticate.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound | SessionError::Malformed(_) | SessionError::Expired
        )
    }

    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            SessionError::NotFound => "not_found",
            SessionError::Malformed(_) => "malformed",
            SessionError::Expired => "expired",
            SessionError::TooLarge { .. } => "too_large",
            SessionError::StorageUnavailable(_) => "unavailable",
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed(msg) => SessionError::Malformed(msg),
            CodecError::Expired => SessionError::Expired,
        }
    }
}

/// Persistence for verified identities.
///
/// Implementations must be safe to share across all request handlers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Persist a record and return the token to put in the session cookie.
    async fn save(&self, record: &IdentityRecord) -> SessionResult<String>;

    /// Resolve a token from the session cookie.
    async fn load(&self, token: &str) -> SessionResult<IdentityRecord>;

    /// Forget a session. Clearing an unknown token succeeds.
    async fn clear(&self, token: &str) -> SessionResult<()>;
}

pub type SharedSessionStore = Arc<dyn SessionStore>;

/// Shortened token for log fields.
pub(crate) fn token_hint(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

/// Record the outcome of a session operation.
pub(crate) fn observe<T>(backend: &str, operation: &str, result: &SessionResult<T>) {
    let label = match result {
        Ok(_) => "ok",
        Err(e) => e.metric_label(),
    };
    crate::observability::metrics::record_session_operation(backend, operation, label);
}
