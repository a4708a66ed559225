//! OIDC callback: finish a login started by the root handler.

use axum::response::{IntoResponse, Response};
use chrono::Utc;
use subtle::ConstantTimeEq;
use tower_cookies::Cookies;
use url::Url;

use super::{cookies, forward::ForwardedRequest};
use crate::{
    AppState,
    auth::{AuthError, LoginState},
    config::CookieConfig,
    session::IdentityRecord,
};

pub(super) async fn handle(
    state: &AppState,
    cookies: &Cookies,
    request: &ForwardedRequest,
) -> Result<Response, AuthError> {
    let config = &state.config;
    let param = |key: &str| {
        request
            .target
            .query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    if let Some(error) = param("error") {
        let description = param("error_description").unwrap_or("no description");
        tracing::warn!(error, description, "Identity provider returned an error");
        return Err(AuthError::BadRequest(format!(
            "identity provider returned '{error}'"
        )));
    }

    let (nonce, return_url) = param("state")
        .and_then(|s| s.split_once(':'))
        .ok_or_else(|| AuthError::BadRequest("missing or malformed state".into()))?;

    let login = cookies
        .get(&config.cookie.csrf_name)
        .and_then(|c| LoginState::from_cookie_value(c.value()))
        .ok_or_else(|| {
            tracing::warn!(host = %request.target.host, "Callback without a login cookie");
            AuthError::InvalidState
        })?;
    cookies.remove(cookies::removal(
        &config.cookie,
        &config.cookie.csrf_name,
        &request.target.host,
    ));

    if !bool::from(login.nonce.as_bytes().ct_eq(nonce.as_bytes())) {
        tracing::warn!(
            host = %request.target.host,
            "Callback state does not match the login cookie"
        );
        return Err(AuthError::InvalidState);
    }

    let return_url = allowed_return_url(return_url, &request.target.host, &config.cookie)
        .ok_or_else(|| {
            tracing::warn!(return_url, "Refusing to redirect outside the cookie domains");
            AuthError::BadRequest("return URL is not allowed".into())
        })?;

    let code = param("code").ok_or_else(|| AuthError::BadRequest("missing code".into()))?;
    // Must match the value sent to the provider in the authorization request.
    let redirect_uri =
        request.redirect_uri(config.oidc.auth_host.as_deref(), &config.oidc.callback_path);

    let identity = match state
        .identity_provider
        .verify_and_exchange(code, &redirect_uri, &login)
        .await
    {
        Ok(identity) => identity,
        Err(AuthError::Unavailable(reason)) => return Err(AuthError::Unavailable(reason)),
        Err(e) => {
            tracing::warn!(error = %e, "Code exchange failed; restarting login");
            return Ok(AuthError::Redirect {
                location: return_url,
            }
            .into_response());
        }
    };

    let issued_at = Utc::now();
    let record = IdentityRecord {
        subject: identity.subject,
        claims: identity.claims,
        groups: identity.groups,
        issued_at,
        expires_at: issued_at + config.cookie.lifetime(),
        id_token: Some(identity.id_token),
    };

    let token = state.session_store().save(&record).await?;
    cookies.add(cookies::session(&config.cookie, &request.target.host, token));

    tracing::info!(
        subject = %record.subject,
        groups = record.groups.len(),
        backend = state.session_store().backend(),
        "Session created"
    );
    Ok(AuthError::Redirect {
        location: return_url,
    }
    .into_response())
}

/// Only redirect to hosts the session cookie is valid for.
fn allowed_return_url(raw: &str, request_host: &str, cookie: &CookieConfig) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    (host == request_host || cookie.domain_for_host(&host).is_some()).then(|| url.into())
}
