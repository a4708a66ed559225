use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on. The reverse proxy's forward-auth address points here.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Overall deadline for a single authorization decision, in milliseconds.
    ///
    /// Session lookups against a remote store and access reviews share this
    /// budget. When it runs out the request is answered with 503 instead of
    /// hanging the proxy.
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,

    /// Seconds to wait for in-flight requests during graceful shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            decision_timeout_ms: default_decision_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    4181
}

fn default_decision_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}
