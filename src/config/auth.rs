use serde::{Deserialize, Serialize};

use super::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// OIDC provider
// ─────────────────────────────────────────────────────────────────────────────

/// OpenID Connect provider configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    /// Issuer URL. Discovery is fetched from
    /// `{issuer_url}/.well-known/openid-configuration` unless overridden.
    pub issuer_url: String,

    /// Explicit discovery document URL.
    #[serde(default)]
    pub discovery_url: Option<String>,

    /// OAuth client ID registered with the provider.
    pub client_id: String,

    /// OAuth client secret.
    pub client_secret: String,

    /// Scopes requested during login.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// Claim holding the user's groups.
    #[serde(default = "default_groups_claim")]
    pub groups_claim: String,

    /// Claim holding the user's email address.
    #[serde(default = "default_email_claim")]
    pub email_claim: String,

    /// Path the provider redirects back to after login.
    /// Logout is served at `{callback_path}/logout`.
    #[serde(default = "default_callback_path")]
    pub callback_path: String,

    /// Single host that receives every callback. When unset, the callback
    /// goes back to whatever host started the login.
    #[serde(default)]
    pub auth_host: Option<String>,

    /// How long a fetched discovery document stays cached, in seconds.
    #[serde(default = "default_discovery_cache_secs")]
    pub discovery_cache_secs: u64,

    /// Timeout for calls to the provider, in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Logout handling.
    #[serde(default)]
    pub logout: LogoutConfig,
}

impl std::fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcConfig")
            .field("issuer_url", &self.issuer_url)
            .field("discovery_url", &self.discovery_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"****")
            .field("scopes", &self.scopes)
            .field("groups_claim", &self.groups_claim)
            .field("email_claim", &self.email_claim)
            .field("callback_path", &self.callback_path)
            .field("auth_host", &self.auth_host)
            .field("logout", &self.logout)
            .finish()
    }
}

impl OidcConfig {
    pub(super) fn normalize(&mut self) {
        if !self.callback_path.starts_with('/') {
            self.callback_path = format!("/{}", self.callback_path);
        }
        while self.callback_path.len() > 1 && self.callback_path.ends_with('/') {
            self.callback_path.pop();
        }
        if let Some(host) = &self.auth_host {
            self.auth_host = Some(host.to_ascii_lowercase());
        }
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "oidc.issuer_url cannot be empty".into(),
            ));
        }
        url::Url::parse(&self.issuer_url).map_err(|e| {
            ConfigError::Validation(format!("oidc.issuer_url is not a valid URL: {e}"))
        })?;
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Validation("oidc.client_id cannot be empty".into()));
        }
        if self.client_secret.is_empty() {
            return Err(ConfigError::Validation(
                "oidc.client_secret cannot be empty".into(),
            ));
        }
        if !self.scopes.iter().any(|s| s == "openid") {
            return Err(ConfigError::Validation(
                "oidc.scopes must include \"openid\"".into(),
            ));
        }
        if self.callback_path == "/" {
            return Err(ConfigError::Validation(
                "oidc.callback_path cannot be the root path".into(),
            ));
        }
        if self.logout.enabled
            && let Some(redirect) = &self.logout.redirect_url
        {
            url::Url::parse(redirect).map_err(|e| {
                ConfigError::Validation(format!("oidc.logout.redirect_url is invalid: {e}"))
            })?;
        }
        Ok(())
    }

    /// Path serving logout when enabled.
    pub fn logout_path(&self) -> String {
        format!("{}/logout", self.callback_path)
    }

    /// Discovery document URL, derived from the issuer when not set explicitly.
    pub fn discovery_url(&self) -> String {
        self.discovery_url.clone().unwrap_or_else(|| {
            format!(
                "{}/.well-known/openid-configuration",
                self.issuer_url.trim_end_matches('/')
            )
        })
    }
}

/// Logout configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogoutConfig {
    /// Serve the logout endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Where to send the browser after the session is cleared.
    #[serde(default)]
    pub redirect_url: Option<String>,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".into(), "profile".into(), "email".into()]
}

fn default_groups_claim() -> String {
    "groups".into()
}

fn default_email_claim() -> String {
    "email".into()
}

fn default_callback_path() -> String {
    "/_oauth".into()
}

fn default_discovery_cache_secs() -> u64 {
    3600
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

// ─────────────────────────────────────────────────────────────────────────────
// Cookies
// ─────────────────────────────────────────────────────────────────────────────

/// Cookie configuration shared by both session backends.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    /// Session cookie name.
    #[serde(default = "default_cookie_name")]
    pub name: String,

    /// Cookie carrying the login CSRF nonce.
    #[serde(default = "default_csrf_cookie_name")]
    pub csrf_name: String,

    /// Domains the session cookie may be scoped to. A request host picks the
    /// first domain it equals or is a subdomain of.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Drop the `Secure` attribute (plain-HTTP development only).
    #[serde(default)]
    pub insecure: bool,

    /// SameSite attribute.
    #[serde(default)]
    pub same_site: SameSite,

    /// Session lifetime in seconds; also the cookie Max-Age.
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,

    /// Authentication key for signing cookies.
    pub secret: String,

    /// Encryption key for cookie payloads. Required by the cookie backend.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl std::fmt::Debug for CookieConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieConfig")
            .field("name", &self.name)
            .field("csrf_name", &self.csrf_name)
            .field("domains", &self.domains)
            .field("insecure", &self.insecure)
            .field("same_site", &self.same_site)
            .field("lifetime_secs", &self.lifetime_secs)
            .field("secret", &"****")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "****"))
            .finish()
    }
}

/// Secrets shorter than this still work but are flagged at startup.
const RECOMMENDED_SECRET_BYTES: usize = 32;

impl CookieConfig {
    pub(super) fn normalize(&mut self) {
        for domain in &mut self.domains {
            *domain = domain.trim_start_matches('.').to_ascii_lowercase();
        }
    }

    /// Warn about a short secret. Call after tracing is initialized.
    pub fn warn_if_weak_secret(&self) {
        if self.secret.len() < RECOMMENDED_SECRET_BYTES {
            tracing::warn!(
                length = self.secret.len(),
                recommended = RECOMMENDED_SECRET_BYTES,
                "cookie.secret is shorter than recommended"
            );
        }
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Validation(
                "cookie.secret is required".into(),
            ));
        }
        if self.name.is_empty() || self.csrf_name.is_empty() {
            return Err(ConfigError::Validation(
                "cookie names cannot be empty".into(),
            ));
        }
        if self.name == self.csrf_name {
            return Err(ConfigError::Validation(
                "cookie.name and cookie.csrf_name must differ".into(),
            ));
        }
        if self.lifetime_secs == 0 {
            return Err(ConfigError::Validation(
                "cookie.lifetime_secs cannot be zero".into(),
            ));
        }
        if matches!(self.same_site, SameSite::None) && self.insecure {
            return Err(ConfigError::Validation(
                "cookie.same_site = \"none\" requires secure cookies".into(),
            ));
        }
        Ok(())
    }

    /// Cookie domain to use for a request host, if any configured domain covers it.
    pub fn domain_for_host(&self, host: &str) -> Option<&str> {
        let host = host.to_ascii_lowercase();
        self.domains
            .iter()
            .find(|domain| {
                host == domain.as_str()
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            })
            .map(String::as_str)
    }

    pub fn secure(&self) -> bool {
        !self.insecure
    }

    pub fn lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lifetime_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

impl From<SameSite> for tower_cookies::cookie::SameSite {
    fn from(value: SameSite) -> Self {
        match value {
            SameSite::Lax => Self::Lax,
            SameSite::Strict => Self::Strict,
            SameSite::None => Self::None,
        }
    }
}

fn default_cookie_name() -> String {
    "_forward_auth".into()
}

fn default_csrf_cookie_name() -> String {
    "_forward_auth_csrf".into()
}

fn default_lifetime_secs() -> u64 {
    43_200
}
