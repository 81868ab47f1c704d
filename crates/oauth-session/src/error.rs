//! Error types for the authorization flow and token lifecycle

use std::fmt;
use std::time::Duration;

/// Why a callback was rejected.
///
/// All of these surface as [`Error::Authorization`]; the reason is kept so a
/// caller can tell a forged callback apart from a cancelled consent screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationFailure {
    /// `state` did not match the live nonce (possible CSRF)
    InvalidState,
    /// Redirect carried neither a code nor a provider error
    MissingCode,
    /// Provider redirected with `error=<reason>`
    Denied(String),
    /// Another attempt is already live on this authorizer
    AttemptInProgress,
}

impl fmt::Display for AuthorizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorizationFailure::InvalidState => write!(f, "invalid state"),
            AuthorizationFailure::MissingCode => write!(f, "no code received"),
            AuthorizationFailure::Denied(reason) => write!(f, "provider denied access: {reason}"),
            AuthorizationFailure::AttemptInProgress => {
                write!(f, "another authorization attempt is in progress")
            }
        }
    }
}

/// Errors from OAuth session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authorization failed: {0}")]
    Authorization(AuthorizationFailure),

    #[error("HTTP request failed: {0}")]
    Network(String),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("grant rejected by provider: {0}")]
    InvalidGrant(String),

    #[error("no authorization callback received within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("callback listener error: {0}")]
    Listener(String),

    #[error("no credential available yet")]
    NotAuthenticated,

    #[error("credential expired at {0} (unix ms)")]
    ExpiredCredential(u64),

    #[error("failed to build authorized client: {0}")]
    Client(String),
}

impl Error {
    /// Whether retrying the same request can never succeed.
    ///
    /// Revoked refresh tokens and missing refresh tokens are permanent;
    /// transport failures and 5xx responses are not.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidGrant(_) | Error::Refresh(_) | Error::Configuration(_)
        )
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
