//! Identity headers returned to the proxy on an allowed request.

use http::{HeaderMap, HeaderName, HeaderValue, header};

use super::AuthError;
use crate::{
    authz::{ClusterPrincipal, prefixed_groups},
    config::{ConfigError, HeadersConfig, RbacConfig},
    session::IdentityRecord,
};

const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");

/// Header names resolved once at startup.
#[derive(Debug, Clone)]
pub struct IdentityHeaders {
    user_headers: Vec<HeaderName>,
    groups_header: Option<HeaderName>,
    forward_token: Option<(HeaderName, String)>,
    rbac: RbacConfig,
    /// Service account bearer credential; impersonation is on when present.
    impersonation_token: Option<String>,
}

impl IdentityHeaders {
    /// `impersonation_token` comes from
    /// `ImpersonationConfig::read_service_account_token`.
    pub fn from_config(
        config: &HeadersConfig,
        rbac: &RbacConfig,
        impersonation_token: Option<String>,
    ) -> Result<Self, ConfigError> {
        let parse = |name: &str| {
            HeaderName::try_from(name).map_err(|_| {
                ConfigError::Validation(format!("'{name}' is not a valid header name"))
            })
        };

        Ok(Self {
            user_headers: config
                .user_headers
                .iter()
                .map(|name| parse(name.as_str()))
                .collect::<Result<_, _>>()?,
            groups_header: config.groups_header.as_deref().map(parse).transpose()?,
            forward_token: config
                .forward_token_header
                .as_deref()
                .map(|name| {
                    Ok::<_, ConfigError>((parse(name)?, config.forward_token_prefix.clone()))
                })
                .transpose()?,
            rbac: rbac.clone(),
            impersonation_token,
        })
    }

    /// Names of every header this instance may set. The proxy must be told to
    /// copy these upstream.
    pub fn names(&self) -> Vec<HeaderName> {
        let mut names = self.user_headers.clone();
        names.extend(self.groups_header.iter().cloned());
        names.extend(self.forward_token.iter().map(|(name, _)| name.clone()));
        if self.impersonation_token.is_some() {
            names.extend([IMPERSONATE_USER, IMPERSONATE_GROUP, header::AUTHORIZATION]);
        }
        names
    }

    pub fn build(&self, identity: &IdentityRecord) -> Result<HeaderMap, AuthError> {
        let mut headers = HeaderMap::new();
        let user_value = value(identity.email().unwrap_or(&identity.subject))?;

        for name in &self.user_headers {
            headers.insert(name.clone(), user_value.clone());
        }

        let groups = prefixed_groups(&identity.groups, &self.rbac.group_prefix);
        if let Some(name) = &self.groups_header
            && !groups.is_empty()
        {
            headers.insert(name.clone(), value(&groups.join(","))?);
        }

        if let Some((name, prefix)) = &self.forward_token {
            match &identity.id_token {
                Some(token) => {
                    headers.insert(name.clone(), value(&format!("{prefix}{token}"))?);
                }
                None => tracing::debug!(
                    subject = %identity.subject,
                    "Session has no ID token to forward"
                ),
            }
        }

        if let Some(token) = &self.impersonation_token {
            // Same principal the access review authorized.
            let principal = ClusterPrincipal::new(identity, &self.rbac);
            headers.insert(IMPERSONATE_USER, value(&principal.user)?);
            for group in &principal.groups {
                headers.append(IMPERSONATE_GROUP, value(group)?);
            }
            headers.insert(header::AUTHORIZATION, value(&format!("Bearer {token}"))?);
        }

        Ok(headers)
    }
}

fn value(raw: &str) -> Result<HeaderValue, AuthError> {
    HeaderValue::try_from(raw).map_err(|_| {
        tracing::warn!("Identity value cannot be sent as a header");
        AuthError::Internal("identity value is not a valid header value".into())
    })
}
