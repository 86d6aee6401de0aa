//! Error types for session operations
//!
//! `Clone` because one authorization flow result is handed to every caller
//! that joined it.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] spotify_auth::Error),

    #[error("no authorization code in callback")]
    MissingAuthorizationCode,

    #[error("authorization denied: {0}")]
    AccessDenied(String),

    #[error("token response did not include a refresh token")]
    MissingRefreshToken,

    #[error("timed out after {0}s waiting for the authorization redirect")]
    RedirectTimeout(u64),

    #[error("authorization flow cancelled")]
    Cancelled,

    #[error("failed to open browser: {0}")]
    BrowserLaunch(String),

    #[error("redirect listener closed: {0}")]
    RedirectClosed(String),

    #[error("no session matching scopes: {0}")]
    NoMatchingSession(String),

    #[error("invalid scopes: {0}")]
    InvalidScopes(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("secret storage error: {0}")]
    Storage(String),

    #[error("session data parse error: {0}")]
    SessionParse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Auth(spotify_auth::Error::Network(_)) => "network",
            Error::Auth(spotify_auth::Error::Server { .. }) => "server",
            Error::Auth(_) => "request",
            Error::MissingAuthorizationCode
            | Error::AccessDenied(_)
            | Error::MissingRefreshToken => "protocol",
            Error::RedirectTimeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::BrowserLaunch(_) | Error::RedirectClosed(_) => "collaborator",
            Error::NoMatchingSession(_) | Error::NotFound(_) => "not_found",
            Error::InvalidScopes(_) => "invalid_scopes",
            Error::Storage(_) | Error::SessionParse(_) => "storage",
            Error::Internal(_) => "internal",
        }
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
