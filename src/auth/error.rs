use std::fmt;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::session::SessionError;

/// Seconds a client should wait before retrying after a 503.
const RETRY_AFTER_SECS: &str = "5";

#[derive(Debug)]
pub enum AuthError {
    /// Send the browser to the identity provider (or back to the app).
    Redirect { location: String },

    /// The request lacks forwarded headers or callback parameters.
    BadRequest(String),

    /// Login state did not verify (CSRF mismatch, stale callback).
    InvalidState,

    /// The provider returned an ID token that failed validation.
    InvalidToken,

    /// Definitive authorization deny.
    Forbidden(String),

    /// The verified identity does not fit in a session cookie. Needs an
    /// operator: shrink the claims or switch to cluster session storage.
    SessionTooLarge { size: usize, limit: usize },

    /// Session storage, access review or the provider is unreachable.
    Unavailable(String),

    /// Internal error during authentication
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorInfo<'a>,
}

#[derive(Serialize)]
struct ErrorInfo<'a> {
    code: &'a str,
    message: &'a str,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Redirect { .. } => StatusCode::FOUND,
            AuthError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidState | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::SessionTooLarge { .. } | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AuthError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match &self {
            AuthError::Redirect { location } => {
                let mut response = status.into_response();
                match HeaderValue::try_from(location.as_str()) {
                    Ok(value) => {
                        response.headers_mut().insert(header::LOCATION, value);
                    }
                    Err(_) => {
                        tracing::error!(
                            location = %location,
                            "Redirect target is not a valid header value"
                        );
                        return AuthError::Internal("invalid redirect target".into())
                            .into_response();
                    }
                }
                return response;
            }
            AuthError::BadRequest(msg) => ("bad_request", msg.clone()),
            AuthError::InvalidState => (
                "invalid_state",
                "Login state could not be verified; start again".to_string(),
            ),
            AuthError::InvalidToken => ("invalid_token", "Invalid identity token".to_string()),
            // Denial details stay in the logs.
            AuthError::Forbidden(_) => ("forbidden", "Access forbidden".to_string()),
            AuthError::SessionTooLarge { size, limit } => (
                "session_too_large",
                format!(
                    "Session of {size} bytes exceeds the {limit} byte cookie limit; \
                     reduce the token claims or use the cluster session backend"
                ),
            ),
            AuthError::Unavailable(_) => (
                "unavailable",
                "Authorization is temporarily unavailable; retry shortly".to_string(),
            ),
            AuthError::Internal(_) => ("internal_error", "Internal error".to_string()),
        };

        let body = ErrorBody {
            error: ErrorInfo {
                code,
                message: &message,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Redirect { location } => write!(f, "Redirect to {}", location),
            AuthError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AuthError::InvalidState => write!(f, "Invalid login state"),
            AuthError::InvalidToken => write!(f, "Invalid identity token"),
            AuthError::Forbidden(msg) => write!(f, "Access forbidden: {}", msg),
            AuthError::SessionTooLarge { size, limit } => {
                write!(f, "Session too large: {} bytes exceeds {}", size, limit)
            }
            AuthError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            AuthError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<SessionError> for AuthError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::TooLarge { size, limit } => AuthError::SessionTooLarge { size, limit },
            SessionError::StorageUnavailable(msg) => AuthError::Unavailable(msg),
            other => AuthError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_is_302_with_location() {
        let response = AuthError::Redirect {
            location: "https://idp.example.com/authorize?x=1".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://idp.example.com/authorize?x=1"
        );
    }

    #[test]
    fn test_unavailable_and_forbidden_are_distinct() {
        let unavailable = AuthError::Unavailable("etcd down".into()).into_response();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(unavailable.headers()[header::RETRY_AFTER], "5");

        let forbidden = AuthError::Forbidden("nope".into()).into_response();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
        assert!(forbidden.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_too_large_is_500() {
        let response = AuthError::SessionTooLarge {
            size: 5000,
            limit: 4096,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_session_errors_map_to_status() {
        let too_large: AuthError = SessionError::TooLarge { size: 5000, limit: 4096 }.into();
        assert!(matches!(too_large, AuthError::SessionTooLarge { size: 5000, limit: 4096 }));

        let down: AuthError = SessionError::StorageUnavailable("timeout".into()).into();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_invalid_state_is_401() {
        assert_eq!(
            AuthError::InvalidState.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
