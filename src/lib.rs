//! Forward-authentication service for reverse proxies.
//!
//! The proxy asks this service about every request. Requests are allowed by
//! rule, authenticated against an OIDC provider with a session cookie, and
//! optionally authorized with a Kubernetes `SubjectAccessReview`. Allowed
//! requests get identity headers for the upstream.

use std::sync::Arc;

pub mod auth;
pub mod authz;
pub mod config;
pub mod observability;
pub mod routes;
pub mod rules;
pub mod session;

use auth::{IdentityHeaders, SharedIdentityProvider};
use authz::AuthorizationDecider;
use config::ForwardAuthConfig;
use session::SharedSessionStore;

/// Shared state for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ForwardAuthConfig>,
    pub decider: Arc<AuthorizationDecider>,
    pub identity_provider: SharedIdentityProvider,
    pub identity_headers: Arc<IdentityHeaders>,
}

impl AppState {
    pub fn session_store(&self) -> &SharedSessionStore {
        self.decider.store()
    }
}
