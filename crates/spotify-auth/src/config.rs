//! Spotify OAuth client configuration
//!
//! The defaults are the public client used by the editor extension this agent
//! replaces. None of them are secrets: a PKCE public client has no client
//! secret, and the tokens themselves live in the session store.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Public OAuth client ID registered with Spotify
pub const DEFAULT_CLIENT_ID: &str = "9646f25e38854db48469def03ca04c98";

/// HTTPS relay registered as the client's redirect URI. It forwards the
/// authorization response to whatever URI was passed as `state`.
pub const DEFAULT_RELAY_REDIRECT_URI: &str = "https://vscode.dev/redirect";

pub const DEFAULT_AUTHORIZE_ENDPOINT: &str = "https://accounts.spotify.com/authorize";

/// Token endpoint for code exchange and token refresh
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://accounts.spotify.com/api/token";

/// Current-user profile endpoint, used to label sessions
pub const DEFAULT_USER_INFO_ENDPOINT: &str = "https://api.spotify.com/v1/me";

/// Where the host listens for the relayed redirect when nothing else is configured
pub const DEFAULT_CALLBACK_URI: &str = "http://127.0.0.1:8888/callback";

/// Scopes requested when a caller does not name any
pub const DEFAULT_SCOPES: &[&str] = &[
    "user-read-private",
    "user-read-email",
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-read-recently-played",
];

/// Endpoints and identifiers for one OAuth client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub user_info_endpoint: String,
    /// Fixed relay sent as `redirect_uri` in both the authorize URL and the code exchange
    pub redirect_uri: String,
    /// The host's own callback URI, sent as `state` so the relay routes back here
    pub callback_uri: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.into(),
            authorize_endpoint: DEFAULT_AUTHORIZE_ENDPOINT.into(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.into(),
            user_info_endpoint: DEFAULT_USER_INFO_ENDPOINT.into(),
            redirect_uri: DEFAULT_RELAY_REDIRECT_URI.into(),
            callback_uri: DEFAULT_CALLBACK_URI.into(),
        }
    }
}

impl OAuthConfig {
    /// Check that every endpoint is an absolute http(s) URL and the client ID is set.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::InvalidConfig("client_id must not be empty".into()));
        }
        for (name, value) in [
            ("authorize_endpoint", &self.authorize_endpoint),
            ("token_endpoint", &self.token_endpoint),
            ("user_info_endpoint", &self.user_info_endpoint),
            ("redirect_uri", &self.redirect_uri),
            ("callback_uri", &self.callback_uri),
        ] {
            let parsed = url::Url::parse(value)
                .map_err(|e| Error::InvalidConfig(format!("{name} is not a valid URL: {e}")))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(Error::InvalidConfig(format!(
                    "{name} must start with http:// or https://, got: {value}"
                )));
            }
        }
        Ok(())
    }

    /// Default scopes as owned strings.
    pub fn default_scopes() -> Vec<String> {
        DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
    }
}
