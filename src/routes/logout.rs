use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;
use tower_cookies::Cookies;

use super::{cookies, forward::ForwardedRequest};
use crate::{AppState, auth::AuthError, session::token_hint};

/// Forget the session, expire the cookie, then redirect or confirm.
pub(super) async fn handle(
    state: &AppState,
    cookies: &Cookies,
    request: &ForwardedRequest,
) -> Result<Response, AuthError> {
    let cookie_config = &state.config.cookie;

    if let Some(cookie) = cookies.get(&cookie_config.name) {
        let token = cookie.value();
        if !token.is_empty() {
            state.session_store().clear(token).await?;
            tracing::info!(token = %token_hint(token), "Session cleared");
        }
        cookies.remove(cookies::removal(
            cookie_config,
            &cookie_config.name,
            &request.target.host,
        ));
    }

    match &state.config.oidc.logout.redirect_url {
        Some(location) => Ok(AuthError::Redirect {
            location: location.clone(),
        }
        .into_response()),
        None => Ok((StatusCode::OK, Json(json!({ "status": "logged_out" }))).into_response()),
    }
}
