mod error;
mod headers;
pub mod jwt;
pub mod oidc;

pub use error::AuthError;
pub use headers::IdentityHeaders;
pub use oidc::{
    IdentityProvider, LoginState, OidcAuthenticator, SharedIdentityProvider, VerifiedIdentity,
};
