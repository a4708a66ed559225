//! HTTP surface.
//!
//! The proxy sends every request it wants checked to this service, with the
//! original request described by `X-Forwarded-*` headers. Anything that is not
//! a health or metrics probe lands in [`forward::forward_auth`], which
//! dispatches on the forwarded URI.

mod callback;
mod cookies;
pub mod forward;
pub mod health;
mod logout;

use axum::{Router, routing::get};
use tower_cookies::CookieManagerLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    let metrics = &state.config.observability.metrics;
    let mut router = Router::new().route("/healthz", get(health::health_check));
    if metrics.enabled && metrics.path != "/healthz" {
        router = router.route(&metrics.path, get(health::metrics));
    }

    router
        .fallback(forward::forward_auth)
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! An app wired with the cookie session store and a scripted provider.

    use std::{collections::BTreeMap, sync::Arc};

    use async_trait::async_trait;
    use axum::{body::Body, response::Response};
    use chrono::{Duration, Utc};
    use http::{Request, header};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::{
        AppState,
        auth::{AuthError, IdentityHeaders, IdentityProvider, LoginState, VerifiedIdentity},
        authz::AuthorizationDecider,
        config::{ForwardAuthConfig, SessionStorageConfig},
        rules::RuleMatcher,
        session::{CookieSessionStore, IdentityRecord, SharedSessionStore},
    };

    pub const CONFIG: &str = r#"
        [oidc]
        issuer_url = "https://idp.test"
        client_id = "forward-auth"
        client_secret = "client-secret"
        logout = { enabled = true, redirect_url = "https://corp.com/bye" }

        [cookie]
        secret = "0123456789abcdef0123456789abcdef"
        encryption_key = "fedcba9876543210fedcba9876543210"
        domains = ["corp.com"]

        [rules]
        pass_through = ["/.well-known/"]

        [[rules.rule]]
        name = "public"
        action = "allow"
        rule = "PathPrefix:/public"
    "#;

    /// Provider that signs in `user-7` for code `good` and rejects anything else.
    pub struct ScriptedProvider;

    #[async_trait]
    impl IdentityProvider for ScriptedProvider {
        async fn authorization_url(
            &self,
            redirect_uri: &str,
            state: &str,
            login: &LoginState,
        ) -> Result<String, AuthError> {
            let mut url = url::Url::parse("https://idp.test/authorize").unwrap();
            url.query_pairs_mut()
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("state", state)
                .append_pair("nonce", &login.nonce);
            Ok(url.to_string())
        }

        async fn verify_and_exchange(
            &self,
            code: &str,
            _redirect_uri: &str,
            _login: &LoginState,
        ) -> Result<VerifiedIdentity, AuthError> {
            match code {
                "good" => Ok(VerifiedIdentity {
                    subject: "user-7".into(),
                    claims: BTreeMap::from([("email".to_string(), json!("dev@corp.com"))]),
                    groups: vec!["viewers".into()],
                    id_token: "eyJ.id.token".into(),
                }),
                "down" => Err(AuthError::Unavailable("token endpoint timed out".into())),
                _ => Err(AuthError::InvalidToken),
            }
        }
    }

    pub fn config() -> ForwardAuthConfig {
        ForwardAuthConfig::from_str(CONFIG).unwrap()
    }

    pub fn cookie_store(config: &ForwardAuthConfig) -> SharedSessionStore {
        let SessionStorageConfig::Cookie(storage) = &config.session else {
            panic!("test config uses the cookie backend");
        };
        Arc::new(CookieSessionStore::from_config(&config.cookie, storage).unwrap())
    }

    pub fn state_with(config: ForwardAuthConfig, store: SharedSessionStore) -> AppState {
        let matcher = Arc::new(RuleMatcher::compile(&config.rules).unwrap());
        let decider = AuthorizationDecider::new(&config, matcher, store, None);
        let identity_headers = IdentityHeaders::from_config(
            &config.headers,
            &config.authorization.rbac,
            None,
        )
        .unwrap();
        AppState {
            config: Arc::new(config),
            decider: Arc::new(decider),
            identity_provider: Arc::new(ScriptedProvider),
            identity_headers: Arc::new(identity_headers),
        }
    }

    pub fn state() -> AppState {
        let config = config();
        let store = cookie_store(&config);
        state_with(config, store)
    }

    pub fn record() -> IdentityRecord {
        let now = Utc::now();
        IdentityRecord {
            subject: "user-7".into(),
            claims: BTreeMap::from([("email".to_string(), json!("dev@corp.com"))]),
            groups: vec!["viewers".into()],
            issued_at: now,
            expires_at: now + Duration::hours(1),
            id_token: None,
        }
    }

    /// A forwarded request for `https://{host}{uri}`.
    pub fn forwarded(host: &str, uri: &str) -> http::request::Builder {
        Request::builder()
            .uri("/")
            .header("x-forwarded-method", "GET")
            .header("x-forwarded-proto", "https")
            .header("x-forwarded-host", host)
            .header("x-forwarded-uri", uri)
    }

    pub async fn send(state: AppState, request: http::request::Builder) -> Response {
        super::build_router(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    pub fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    pub fn location(response: &Response) -> String {
        response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .to_string()
    }
}
