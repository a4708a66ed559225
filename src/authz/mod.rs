//! Authorization: turn a request and its session cookie into a decision.
//!
//! The flow for one request:
//! 1. Rules decide whether the request needs a session at all
//! 2. The session token is resolved through the active session store
//! 3. The identity's email is checked against the configured policy
//! 4. With RBAC enabled, the cluster reviews subject and groups against the
//!    requested path
//!
//! Steps 2 to 4 share one deadline. An outage anywhere fails closed as
//! [`Decision::Unavailable`], never as a missing session.

mod access_review;
mod decider;
mod email;

use std::fmt;

#[cfg(feature = "kubernetes")]
pub use access_review::KubeAccessReviewer;
pub use access_review::{AccessDecision, AccessReviewError, AccessReviewRequest, AccessReviewer};
pub use decider::AuthorizationDecider;
pub use email::EmailPolicy;

use crate::{config::RbacConfig, session::IdentityRecord};

/// Final outcome for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A rule or pass-through prefix allows the request without a session.
    Bypass,
    /// Valid session that passed every check.
    Allowed(IdentityRecord),
    /// Redirect to the identity provider.
    BeginAuthentication(AuthRequiredReason),
    /// Definitive deny.
    Forbidden(String),
    /// Session storage or access review failed; the client may retry.
    Unavailable(String),
}

impl Decision {
    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            Decision::Bypass => "bypass",
            Decision::Allowed(_) => "allowed",
            Decision::BeginAuthentication(_) => "begin_auth",
            Decision::Forbidden(_) => "forbidden",
            Decision::Unavailable(_) => "unavailable",
        }
    }
}

/// Why authentication has to start over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequiredReason {
    NoSession,
    Expired,
    Invalid,
}

impl fmt::Display for AuthRequiredReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRequiredReason::NoSession => write!(f, "no_session"),
            AuthRequiredReason::Expired => write!(f, "expired"),
            AuthRequiredReason::Invalid => write!(f, "invalid"),
        }
    }
}

/// Apply the external group prefix.
pub fn prefixed_groups(groups: &[String], prefix: &str) -> Vec<String> {
    groups.iter().map(|g| format!("{prefix}{g}")).collect()
}

/// The user and groups presented to the cluster. Access review and
/// impersonation both use this, so the reviewed principal is the one acted as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPrincipal {
    pub user: String,
    pub groups: Vec<String>,
}

impl ClusterPrincipal {
    pub fn new(identity: &IdentityRecord, rbac: &RbacConfig) -> Self {
        let mut user = identity.subject.clone();
        let mut groups = prefixed_groups(&identity.groups, &rbac.group_prefix);
        if rbac.case_insensitive_subjects {
            user = user.to_lowercase();
            groups.iter_mut().for_each(|g| *g = g.to_lowercase());
        }
        Self { user, groups }
    }
}
