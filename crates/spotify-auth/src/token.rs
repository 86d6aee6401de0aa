//! OAuth token exchange, refresh, and user identity
//!
//! Three endpoint interactions, each a single call through
//! `ResilientHttpClient`:
//! 1. Authorization code exchange (completes an interactive flow)
//! 2. Token refresh (background scheduler)
//! 3. Current-user lookup (labels a new session)
//!
//! Exchange and refresh POST to `token_endpoint` with different grant types.

use serde::{Deserialize, Serialize};

use crate::config::OAuthConfig;
use crate::error::Result;
use crate::http::{HttpRequest, ResilientHttpClient};

/// Response from the token endpoint for both exchange and refresh.
///
/// `refresh_token` is optional because providers may decline to rotate it on
/// refresh; when absent the stored refresh token stays in use.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// The subset of the user profile needed to label a session.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl UserInfo {
    /// Human-readable label: display name when set, otherwise the user ID.
    pub fn label(&self) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.id.clone(),
        }
    }
}

/// Exchange an authorization code for tokens.
///
/// `verifier` proves this client started the flow that produced `code`.
pub async fn exchange_code(
    http: &ResilientHttpClient,
    config: &OAuthConfig,
    code: &str,
    verifier: &str,
) -> Result<TokenResponse> {
    let request = HttpRequest::post_form(
        &config.token_endpoint,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &config.redirect_uri),
            ("client_id", &config.client_id),
            ("code_verifier", verifier),
        ],
    );
    http.send_json(&request).await
}

/// Mint a new access token from a refresh token.
pub async fn refresh_token(
    http: &ResilientHttpClient,
    config: &OAuthConfig,
    refresh: &str,
) -> Result<TokenResponse> {
    let request = HttpRequest::post_form(
        &config.token_endpoint,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", &config.client_id),
        ],
    );
    http.send_json(&request).await
}

/// Look up the user that `access_token` belongs to.
pub async fn fetch_user_info(
    http: &ResilientHttpClient,
    config: &OAuthConfig,
    access_token: &str,
) -> Result<UserInfo> {
    let request = HttpRequest::get(&config.user_info_endpoint).bearer(access_token);
    http.send_json(&request).await
}
