//! The forward-auth root handler.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use http::{HeaderMap, StatusCode, header};
use tower_cookies::Cookies;

use super::{callback, cookies, logout};
use crate::{
    AppState,
    auth::{AuthError, LoginState},
    authz::{AuthRequiredReason, Decision},
    rules::RequestTarget,
};

const X_FORWARDED_METHOD: &str = "x-forwarded-method";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_URI: &str = "x-forwarded-uri";

/// The proxied request, reconstructed from `X-Forwarded-*` headers.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub proto: String,
    /// Host as sent, including any port.
    pub authority: String,
    pub target: RequestTarget,
}

impl ForwardedRequest {
    pub fn from_headers(headers: &HeaderMap, default_proto: &str) -> Result<Self, AuthError> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let authority = read(X_FORWARDED_HOST)
            .or_else(|| read(header::HOST.as_str()))
            .ok_or_else(|| AuthError::BadRequest("missing X-Forwarded-Host".into()))?
            .to_string();
        let method = read(X_FORWARDED_METHOD).unwrap_or("GET");
        let uri = read(X_FORWARDED_URI).unwrap_or("/");
        let proto = match read(X_FORWARDED_PROTO) {
            Some(proto @ ("http" | "https")) => proto.to_string(),
            Some(other) => {
                return Err(AuthError::BadRequest(format!(
                    "unsupported X-Forwarded-Proto '{other}'"
                )));
            }
            None => default_proto.to_string(),
        };

        let target = RequestTarget::new(method, &authority, uri).with_headers(headers.clone());
        Ok(Self {
            proto,
            authority,
            target,
        })
    }

    /// The URL the user originally asked for.
    pub fn original_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.proto,
            self.authority,
            self.target.path_and_query()
        )
    }

    /// Callback URL registered with the provider, on `auth_host` when set.
    pub fn redirect_uri(&self, auth_host: Option<&str>, callback_path: &str) -> String {
        format!(
            "{}://{}{}",
            self.proto,
            auth_host.unwrap_or(&self.authority),
            callback_path
        )
    }
}

/// Answer the proxy: 200 (with identity headers) lets the request through,
/// anything else is returned to the client as is.
#[tracing::instrument(name = "forward_auth", skip_all)]
pub async fn forward_auth(
    State(state): State<AppState>,
    cookies: Cookies,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    let default_proto = if state.config.cookie.secure() {
        "https"
    } else {
        "http"
    };
    let request = ForwardedRequest::from_headers(&headers, default_proto)?;
    let oidc = &state.config.oidc;

    if request.target.path == oidc.callback_path {
        return callback::handle(&state, &cookies, &request).await;
    }
    if oidc.logout.enabled && request.target.path == oidc.logout_path() {
        return logout::handle(&state, &cookies, &request).await;
    }

    let token = cookies
        .get(&state.config.cookie.name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());

    match state.decider.decide(&request.target, token.as_deref()).await {
        Decision::Bypass => Ok(StatusCode::OK.into_response()),
        Decision::Allowed(identity) => {
            let headers = state.identity_headers.build(&identity)?;
            Ok((StatusCode::OK, headers).into_response())
        }
        Decision::BeginAuthentication(reason) => {
            if reason != AuthRequiredReason::NoSession {
                cookies.remove(cookies::removal(
                    &state.config.cookie,
                    &state.config.cookie.name,
                    &request.target.host,
                ));
            }
            begin_authentication(&state, &cookies, &request).await
        }
        Decision::Forbidden(reason) => Err(AuthError::Forbidden(reason)),
        Decision::Unavailable(reason) => Err(AuthError::Unavailable(reason)),
    }
}

/// Send the browser to the provider, remembering the login in a CSRF cookie.
pub(super) async fn begin_authentication(
    state: &AppState,
    cookies: &Cookies,
    request: &ForwardedRequest,
) -> Result<Response, AuthError> {
    let oidc = &state.config.oidc;
    let login = LoginState::generate();
    let redirect_uri = request.redirect_uri(oidc.auth_host.as_deref(), &oidc.callback_path);
    let login_state = format!("{}:{}", login.nonce, request.original_url());

    let location = state
        .identity_provider
        .authorization_url(&redirect_uri, &login_state, &login)
        .await?;

    cookies.add(cookies::csrf(
        &state.config.cookie,
        &request.target.host,
        login.to_cookie_value(),
    ));

    tracing::debug!(
        host = %request.target.host,
        path = %request.target.path,
        "Redirecting to identity provider"
    );
    Ok(AuthError::Redirect { location }.into_response())
}
