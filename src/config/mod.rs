//! Configuration module for the forward-auth service.
//!
//! The service is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [oidc]
//! issuer_url = "https://accounts.example.com"
//! client_id = "forward-auth"
//! client_secret = "${OIDC_CLIENT_SECRET}"
//!
//! [cookie]
//! secret = "${COOKIE_SECRET}"
//! encryption_key = "${COOKIE_ENCRYPTION_KEY}"
//! domains = ["example.com"]
//!
//! [[rules.rule]]
//! name = "public"
//! action = "allow"
//! rule = "PathPrefix:/healthz"
//! ```

mod auth;
mod authorization;
mod headers;
mod observability;
mod rules;
mod server;
mod session;

use std::path::Path;

pub use auth::*;
pub use authorization::*;
pub use headers::*;
pub use observability::*;
pub use rules::*;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use session::*;

use crate::rules::{RuleError, RuleMatcher};

/// Root configuration for the forward-auth service.
///
/// `oidc` and `cookie` are required; every other section has defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardAuthConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity provider.
    pub oidc: OidcConfig,

    /// Session and CSRF cookies, including the signing keys.
    pub cookie: CookieConfig,

    /// Session storage backend.
    #[serde(default)]
    pub session: SessionStorageConfig,

    /// Allow/auth rules.
    #[serde(default)]
    pub rules: RulesConfig,

    /// Post-authentication checks (email policy, RBAC).
    #[serde(default)]
    pub authorization: AuthorizationConfig,

    /// Headers injected for the upstream.
    #[serde(default)]
    pub headers: HeadersConfig,

    /// Observability configuration (logging, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ForwardAuthConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        // Catch feature-gated values before typed deserialization so the
        // error names the missing feature instead of a serde variant.
        let raw: toml::Value = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        check_disabled_features(&raw)?;

        let mut config: ForwardAuthConfig = toml::from_str(&expanded)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.oidc.normalize();
        self.cookie.normalize();
        for domain in &mut self.authorization.domains {
            *domain = domain.trim_start_matches('@').to_ascii_lowercase();
        }
    }

    /// Validate the configuration, including compiling every rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.oidc.validate()?;
        self.cookie.validate()?;
        self.session.validate()?;
        self.rules.validate()?;
        self.authorization.validate()?;
        self.headers.validate()?;

        if matches!(self.session, SessionStorageConfig::Cookie(_))
            && self
                .cookie
                .encryption_key
                .as_deref()
                .is_none_or(str::is_empty)
        {
            return Err(ConfigError::Validation(
                "cookie.encryption_key is required when session.type = \"cookie\"".into(),
            ));
        }

        RuleMatcher::compile(&self.rules)?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Invalid rule: {0}")]
    Rule(#[from] RuleError),
}

/// Reject settings that need a cargo feature this binary was built without.
fn check_disabled_features(raw: &toml::Value) -> Result<(), ConfigError> {
    let mut issues: Vec<(&str, &str)> = Vec::new();

    let session_type = raw
        .get("session")
        .and_then(|s| s.get("type"))
        .and_then(|t| t.as_str());
    if session_type == Some("cluster") && !cfg!(feature = "kubernetes") {
        issues.push(("session.type = \"cluster\"", "kubernetes"));
    }

    let rbac_enabled = raw
        .get("authorization")
        .and_then(|a| a.get("rbac"))
        .and_then(|r| r.get("enabled"))
        .and_then(|e| e.as_bool());
    if rbac_enabled == Some(true) && !cfg!(feature = "kubernetes") {
        issues.push(("authorization.rbac.enabled = true", "kubernetes"));
    }

    if issues.is_empty() {
        return Ok(());
    }

    let details = issues
        .iter()
        .map(|(setting, feature)| format!("{setting} requires the '{feature}' feature"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(ConfigError::Validation(format!(
        "{details}. Rebuild with: cargo build --features kubernetes"
    )))
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("env pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [oidc]
        issuer_url = "https://idp.example.com"
        client_id = "forward-auth"
        client_secret = "client-secret"

        [cookie]
        secret = "0123456789abcdef0123456789abcdef"
        encryption_key = "fedcba9876543210fedcba9876543210"
    "#;

    #[test]
    fn test_minimal_config() {
        let config = ForwardAuthConfig::from_str(BASE).unwrap();

        assert_eq!(config.server.port, 4181);
        assert_eq!(config.cookie.name, "_forward_auth");
        assert_eq!(config.cookie.csrf_name, "_forward_auth_csrf");
        assert_eq!(config.cookie.lifetime_secs, 43_200);
        assert_eq!(config.oidc.callback_path, "/_oauth");
        assert_eq!(config.oidc.groups_claim, "groups");
        assert_eq!(config.authorization.rbac.group_prefix, "oidc:");
        assert_eq!(config.headers.user_headers, vec!["X-Forwarded-User"]);
        assert_eq!(config.headers.forward_token_prefix, "Bearer ");
        assert_eq!(config.rules.default_action, RuleAction::Auth);
        assert!(matches!(config.session, SessionStorageConfig::Cookie(_)));
    }

    #[test]
    fn test_rules_keep_declaration_order() {
        let config = ForwardAuthConfig::from_str(&format!(
            r#"{BASE}
            [rules]
            syntax = "pattern"
            pass_through = ["/.well-known"]

            [[rules.rule]]
            name = "zeta"
            action = "allow"
            rule = "PathPrefix(`/public`)"

            [[rules.rule]]
            name = "alpha"
            rule = "Host(`admin.example.com`)"
        "#
        ))
        .unwrap();

        let names: Vec<_> = config.rules.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(config.rules.rules[1].action, RuleAction::Auth);
        assert_eq!(config.rules.syntax, RuleSyntax::Pattern);
    }

    #[test]
    fn test_invalid_rule_action_rejected() {
        let err = ForwardAuthConfig::from_str(&format!(
            r#"{BASE}
            [[rules.rule]]
            name = "bad"
            action = "deny"
            rule = "Path:/x"
        "#
        ))
        .unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)), "got {err}");
    }

    #[test]
    fn test_malformed_rule_is_config_error() {
        let err = ForwardAuthConfig::from_str(&format!(
            r#"{BASE}
            [rules]
            syntax = "pattern"

            [[rules.rule]]
            name = "broken"
            rule = "PathPrefix(`/a`) &&"
        "#
        ))
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("broken"), "should name the rule: {msg}");
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let err = ForwardAuthConfig::from_str(&format!(
            r#"{BASE}
            [[rules.rule]]
            name = "dup"
            rule = "Path:/a"

            [[rules.rule]]
            name = "dup"
            rule = "Path:/b"
        "#
        ))
        .unwrap_err();

        assert!(err.to_string().contains("duplicate rule name"));
    }

    #[test]
    fn test_missing_secret_rejected() {
        let err = ForwardAuthConfig::from_str(
            r#"
            [oidc]
            issuer_url = "https://idp.example.com"
            client_id = "forward-auth"
            client_secret = "client-secret"

            [cookie]
            secret = ""
            encryption_key = "k"
        "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("cookie.secret"));
    }

    #[test]
    fn test_cookie_backend_requires_encryption_key() {
        let err = ForwardAuthConfig::from_str(
            r#"
            [oidc]
            issuer_url = "https://idp.example.com"
            client_id = "forward-auth"
            client_secret = "client-secret"

            [cookie]
            secret = "0123456789abcdef0123456789abcdef"
        "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("encryption_key"));
    }

    #[test]
    #[cfg(feature = "kubernetes")]
    fn test_cluster_backend_does_not_need_encryption_key() {
        let config = ForwardAuthConfig::from_str(
            r#"
            [oidc]
            issuer_url = "https://idp.example.com"
            client_id = "forward-auth"
            client_secret = "client-secret"

            [cookie]
            secret = "0123456789abcdef0123456789abcdef"

            [session]
            type = "cluster"
            namespace = "auth"
            cache_ttl_secs = 30
        "#,
        )
        .unwrap();

        match config.session {
            SessionStorageConfig::Cluster(cluster) => {
                assert_eq!(cluster.namespace, "auth");
                assert_eq!(cluster.cache_ttl_secs, 30);
                assert_eq!(cluster.gc_interval_secs, 60);
            }
            other => panic!("expected cluster backend, got {other:?}"),
        }
    }

    #[test]
    fn test_callback_path_normalized() {
        let config = ForwardAuthConfig::from_str(&BASE.replace(
            "client_secret = \"client-secret\"",
            "client_secret = \"client-secret\"\ncallback_path = \"oauth2/\"",
        ))
        .unwrap();

        assert_eq!(config.oidc.callback_path, "/oauth2");
        assert_eq!(config.oidc.logout_path(), "/oauth2/logout");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ForwardAuthConfig::from_str(&format!(
            r#"{BASE}
            [server]
            prot = 8080
        "#
        ))
        .unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TEST_OIDC_SECRET", Some("from-env"), || {
            let config = ForwardAuthConfig::from_str(
                &BASE.replace("\"client-secret\"", "\"${TEST_OIDC_SECRET}\""),
            )
            .unwrap();
            assert_eq!(config.oidc.client_secret, "from-env");
        });
    }

    #[test]
    fn test_missing_env_var_is_error() {
        temp_env::with_var_unset("TEST_FORWARD_AUTH_UNSET", || {
            let err = expand_env_vars("key = \"${TEST_FORWARD_AUTH_UNSET}\"").unwrap_err();
            assert!(matches!(
                err,
                ConfigError::EnvVarNotFound(name) if name == "TEST_FORWARD_AUTH_UNSET"
            ));
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("# secret = \"${NONEXISTENT_VAR}\"").unwrap();
        assert_eq!(result, "# secret = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_env_var_after_comment_ignored() {
        let result = expand_env_vars("key = \"value\" # ${NONEXISTENT_VAR}").unwrap();
        assert_eq!(result, "key = \"value\" # ${NONEXISTENT_VAR}");
    }
}
