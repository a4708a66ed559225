use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use super::{
    AccessDecision, AccessReviewRequest, AccessReviewer, AuthRequiredReason, ClusterPrincipal,
    Decision, EmailPolicy,
};
use crate::{
    config::{ForwardAuthConfig, RbacConfig},
    observability::metrics,
    rules::{MatchSource, RequestTarget, RuleDecision, RuleMatcher},
    session::{IdentityRecord, SessionError, SharedSessionStore, token_hint},
};

/// Combines rules, session validity, email policy and RBAC into a
/// [`Decision`]. Shared by every request handler.
pub struct AuthorizationDecider {
    matcher: Arc<RuleMatcher>,
    store: SharedSessionStore,
    reviewer: Option<Arc<dyn AccessReviewer>>,
    email_policy: EmailPolicy,
    rbac: RbacConfig,
    deadline: Duration,
}

impl AuthorizationDecider {
    /// `reviewer` is consulted for every authenticated request; pass `None`
    /// when RBAC is disabled.
    pub fn new(
        config: &ForwardAuthConfig,
        matcher: Arc<RuleMatcher>,
        store: SharedSessionStore,
        reviewer: Option<Arc<dyn AccessReviewer>>,
    ) -> Self {
        Self {
            matcher,
            store,
            reviewer,
            email_policy: EmailPolicy::from_config(&config.authorization),
            rbac: config.authorization.rbac.clone(),
            deadline: config.server.decision_timeout(),
        }
    }

    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    pub fn store(&self) -> &SharedSessionStore {
        &self.store
    }

    pub async fn decide(&self, target: &RequestTarget, token: Option<&str>) -> Decision {
        let evaluation = self.matcher.evaluate(target);

        let decision = if evaluation.decision == RuleDecision::Allow {
            match evaluation.source {
                MatchSource::PassThrough(prefix) => {
                    tracing::debug!(path = %target.path, prefix, "Pass-through prefix matched");
                }
                MatchSource::Rule(rule) => {
                    tracing::debug!(
                        host = %target.host,
                        path = %target.path,
                        rule,
                        "Allowed by rule"
                    );
                }
                MatchSource::Default => {
                    tracing::debug!(
                        host = %target.host,
                        path = %target.path,
                        "Allowed by default action"
                    );
                }
            }
            Decision::Bypass
        } else {
            match tokio::time::timeout(self.deadline, self.authorize(target, token)).await {
                Ok(decision) => decision,
                Err(_) => {
                    tracing::warn!(
                        host = %target.host,
                        path = %target.path,
                        deadline_ms = self.deadline.as_millis() as u64,
                        "Authorization deadline exceeded"
                    );
                    Decision::Unavailable(format!(
                        "authorization timed out after {}ms",
                        self.deadline.as_millis()
                    ))
                }
            }
        };

        metrics::record_decision(decision.outcome());
        decision
    }

    async fn authorize(&self, target: &RequestTarget, token: Option<&str>) -> Decision {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Decision::BeginAuthentication(AuthRequiredReason::NoSession);
        };

        let identity = match self.store.load(token).await {
            Ok(identity) => identity,
            Err(SessionError::NotFound) => {
                return Decision::BeginAuthentication(AuthRequiredReason::NoSession);
            }
            Err(SessionError::Expired) => {
                return Decision::BeginAuthentication(AuthRequiredReason::Expired);
            }
            Err(SessionError::Malformed(reason)) => {
                tracing::debug!(token = token_hint(token), reason = %reason, "Invalid session");
                return Decision::BeginAuthentication(AuthRequiredReason::Invalid);
            }
            Err(e) => {
                tracing::warn!(
                    backend = self.store.backend(),
                    error = %e,
                    "Session lookup failed"
                );
                return Decision::Unavailable(e.to_string());
            }
        };

        if let Err(reason) = self.email_policy.check(identity.email()) {
            tracing::info!(subject = %identity.subject, reason = %reason, "Denied by email policy");
            return Decision::Forbidden(reason);
        }

        if let Some(reviewer) = &self.reviewer {
            let request = self.review_request(&identity, target);
            let started = Instant::now();
            let result = reviewer.check_access(&request).await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(AccessDecision::Allowed) => {
                    metrics::record_access_review("allowed", elapsed);
                }
                Ok(AccessDecision::Forbidden(reason)) => {
                    metrics::record_access_review("forbidden", elapsed);
                    tracing::info!(
                        user = %request.user,
                        verb = %request.verb,
                        path = %request.path,
                        host = %request.host,
                        reason = %reason,
                        "Denied by access review"
                    );
                    return Decision::Forbidden(reason);
                }
                Err(e) => {
                    metrics::record_access_review("error", elapsed);
                    tracing::error!(user = %request.user, error = %e, "Access review failed");
                    return Decision::Unavailable(e.to_string());
                }
            }
        }

        Decision::Allowed(identity)
    }

    fn review_request(
        &self,
        identity: &IdentityRecord,
        target: &RequestTarget,
    ) -> AccessReviewRequest {
        let ClusterPrincipal { user, groups } = ClusterPrincipal::new(identity, &self.rbac);
        AccessReviewRequest {
            user,
            groups,
            path: target.path.clone(),
            verb: target.method.to_ascii_lowercase(),
            host: target.host.clone(),
        }
    }
}
