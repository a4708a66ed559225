use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Authorization applied after a session has been validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationConfig {
    /// Email addresses allowed in. Empty means no address restriction.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Email domains allowed in. Empty means no domain restriction.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Kubernetes RBAC checks.
    #[serde(default)]
    pub rbac: RbacConfig,
}

impl AuthorizationConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.whitelist.iter().any(|e| !e.contains('@')) {
            return Err(ConfigError::Validation(
                "authorization.whitelist entries must be email addresses".into(),
            ));
        }
        if self.domains.iter().any(|d| d.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "authorization.domains cannot contain empty entries".into(),
            ));
        }
        Ok(())
    }
}

/// RBAC via SubjectAccessReview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RbacConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prefix added to every group before it is shown to the cluster.
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,

    /// Lowercase subject and groups before review.
    #[serde(default)]
    pub case_insensitive_subjects: bool,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_prefix: default_group_prefix(),
            case_insensitive_subjects: false,
        }
    }
}

fn default_group_prefix() -> String {
    "oidc:".into()
}
