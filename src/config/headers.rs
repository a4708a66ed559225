use std::path::PathBuf;

use http::HeaderName;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Identity headers returned to the proxy on a successful decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadersConfig {
    /// Headers that receive the user's email (or subject when no email).
    #[serde(default = "default_user_headers")]
    pub user_headers: Vec<String>,

    /// Header carrying the comma-joined, prefixed group list.
    #[serde(default = "default_groups_header")]
    pub groups_header: Option<String>,

    /// Header carrying the raw ID token.
    #[serde(default)]
    pub forward_token_header: Option<String>,

    /// Prefix written before the forwarded token.
    #[serde(default = "default_forward_token_prefix")]
    pub forward_token_prefix: String,

    /// Kubernetes impersonation headers.
    #[serde(default)]
    pub impersonation: ImpersonationConfig,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            user_headers: default_user_headers(),
            groups_header: default_groups_header(),
            forward_token_header: None,
            forward_token_prefix: default_forward_token_prefix(),
            impersonation: ImpersonationConfig::default(),
        }
    }
}

impl HeadersConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let names = self
            .user_headers
            .iter()
            .chain(self.groups_header.iter())
            .chain(self.forward_token_header.iter());
        for name in names {
            HeaderName::try_from(name.as_str()).map_err(|_| {
                ConfigError::Validation(format!("'{name}' is not a valid header name"))
            })?;
        }
        Ok(())
    }
}

/// Impersonation of the authenticated user towards the Kubernetes API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImpersonationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Token presented as `Authorization: Bearer` alongside the
    /// impersonation headers.
    #[serde(default = "default_service_account_token_path")]
    pub service_account_token_path: PathBuf,
}

impl Default for ImpersonationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_account_token_path: default_service_account_token_path(),
        }
    }
}

impl ImpersonationConfig {
    /// Read the service account token when impersonation is enabled.
    pub fn read_service_account_token(&self) -> Result<Option<String>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        let token = std::fs::read_to_string(&self.service_account_token_path)
            .map_err(|e| ConfigError::Io(e, self.service_account_token_path.clone()))?;
        let token = token.trim_end_matches(['\n', '\r']).to_string();
        if token.is_empty() {
            return Err(ConfigError::Validation(format!(
                "service account token at {} is empty",
                self.service_account_token_path.display()
            )));
        }
        Ok(Some(token))
    }
}

fn default_user_headers() -> Vec<String> {
    vec!["X-Forwarded-User".into()]
}

fn default_groups_header() -> Option<String> {
    Some("X-Forwarded-Groups".into())
}

fn default_forward_token_prefix() -> String {
    "Bearer ".into()
}

fn default_service_account_token_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}
