//! Error types for OAuth HTTP operations
//!
//! The variants double as the retry classification: only `Network` is
//! transient. Payloads are strings so the error is `Clone` and can be handed
//! to every caller sharing a coalesced authorization flow.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Timeout, connection failure, or a body that did not parse. Retried.
    #[error("network failure: {0}")]
    Network(String),

    /// The endpoint answered with a non-2xx status. Never retried.
    #[error("server failure ({status}): {body}")]
    Server { status: u16, body: String },

    /// The request could not be built or sent for a non-transient reason.
    #[error("request error: {0}")]
    Request(String),

    #[error("invalid OAuth configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the retry layer should try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
