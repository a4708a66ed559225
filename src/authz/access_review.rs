//! Delegated RBAC: ask the cluster whether a subject may reach a path.

use async_trait::async_trait;

/// Who is asking for what. Groups are already prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessReviewRequest {
    pub user: String,
    pub groups: Vec<String>,
    pub path: String,
    /// Lowercased HTTP method (`get`, `post`, ...).
    pub verb: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Forbidden(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AccessReviewError {
    #[error("access review request failed: {0}")]
    Transport(String),

    #[error("access review returned no status")]
    MissingStatus,
}

/// The access-review capability. A transport error is never an answer; the
/// caller must fail closed.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn check_access(
        &self,
        request: &AccessReviewRequest,
    ) -> Result<AccessDecision, AccessReviewError>;
}

#[cfg(feature = "kubernetes")]
mod kube_reviewer {
    use async_trait::async_trait;
    use k8s_openapi::api::authorization::v1::{
        NonResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
    };
    use kube::{
        Client,
        api::{Api, PostParams},
    };

    use super::{AccessDecision, AccessReviewError, AccessReviewRequest, AccessReviewer};

    /// Posts a `SubjectAccessReview` with non-resource attributes.
    pub struct KubeAccessReviewer {
        api: Api<SubjectAccessReview>,
    }

    impl KubeAccessReviewer {
        pub fn new(client: Client) -> Self {
            Self {
                api: Api::all(client),
            }
        }
    }

    #[async_trait]
    impl AccessReviewer for KubeAccessReviewer {
        async fn check_access(
            &self,
            request: &AccessReviewRequest,
        ) -> Result<AccessDecision, AccessReviewError> {
            let review = SubjectAccessReview {
                spec: SubjectAccessReviewSpec {
                    user: Some(request.user.clone()),
                    groups: Some(request.groups.clone()),
                    non_resource_attributes: Some(NonResourceAttributes {
                        path: Some(request.path.clone()),
                        verb: Some(request.verb.clone()),
                    }),
                    ..Default::default()
                },
                ..Default::default()
            };

            let created = self
                .api
                .create(&PostParams::default(), &review)
                .await
                .map_err(|e| AccessReviewError::Transport(e.to_string()))?;
            let status = created.status.ok_or(AccessReviewError::MissingStatus)?;

            if let Some(evaluation_error) = &status.evaluation_error {
                tracing::debug!(
                    user = %request.user,
                    error = %evaluation_error,
                    "Access review reported an evaluation error"
                );
            }

            if status.allowed {
                Ok(AccessDecision::Allowed)
            } else {
                let reason = status.reason.filter(|r| !r.is_empty()).unwrap_or_else(|| {
                    format!("{} {} is not permitted", request.verb, request.path)
                });
                Ok(AccessDecision::Forbidden(reason))
            }
        }
    }
}

#[cfg(feature = "kubernetes")]
pub use kube_reviewer::KubeAccessReviewer;
