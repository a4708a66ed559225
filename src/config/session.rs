use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Session storage backend, chosen once at startup.
///
/// ```toml
/// [session]
/// type = "cluster"
/// namespace = "auth"
/// cache_ttl_secs = 60
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStorageConfig {
    /// Signed and encrypted identity stored in the cookie itself.
    Cookie(CookieStorageConfig),
    /// One Kubernetes Secret per session, fronted by a local cache.
    Cluster(ClusterStorageConfig),
}

impl Default for SessionStorageConfig {
    fn default() -> Self {
        SessionStorageConfig::Cookie(CookieStorageConfig::default())
    }
}

impl SessionStorageConfig {
    pub fn is_cluster(&self) -> bool {
        matches!(self, SessionStorageConfig::Cluster(_))
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        match self {
            SessionStorageConfig::Cookie(c) => {
                if c.max_cookie_bytes < 512 {
                    return Err(ConfigError::Validation(
                        "session.max_cookie_bytes must be at least 512".into(),
                    ));
                }
            }
            SessionStorageConfig::Cluster(c) => {
                if c.namespace.is_empty() {
                    return Err(ConfigError::Validation(
                        "session.namespace cannot be empty".into(),
                    ));
                }
                if c.gc_interval_secs == 0 {
                    return Err(ConfigError::Validation(
                        "session.gc_interval_secs cannot be zero".into(),
                    ));
                }
                if c.remote_timeout_ms == 0 {
                    return Err(ConfigError::Validation(
                        "session.remote_timeout_ms cannot be zero".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Cookie backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieStorageConfig {
    /// Upper bound for `name=value` of the session cookie.
    #[serde(default = "default_max_cookie_bytes")]
    pub max_cookie_bytes: usize,
}

impl Default for CookieStorageConfig {
    fn default() -> Self {
        Self {
            max_cookie_bytes: default_max_cookie_bytes(),
        }
    }
}

/// Cluster backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterStorageConfig {
    /// Namespace holding the session Secrets.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// How long a record read from the cluster is served from memory.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum cached records before stale and then oldest entries are evicted.
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,

    /// Interval between garbage collection passes.
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,

    /// Timeout applied to each call against the cluster API.
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

impl Default for ClusterStorageConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_cache_entries: default_max_cache_entries(),
            gc_interval_secs: default_gc_interval_secs(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

impl ClusterStorageConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

fn default_max_cookie_bytes() -> usize {
    4096
}

fn default_namespace() -> String {
    "default".into()
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_max_cache_entries() -> usize {
    10_000
}

fn default_gc_interval_secs() -> u64 {
    60
}

fn default_remote_timeout_ms() -> u64 {
    2000
}
