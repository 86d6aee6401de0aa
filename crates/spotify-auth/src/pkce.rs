//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge used during the
//! authorization flow. The verifier stays in memory for the lifetime of one
//! flow and is sent during the code exchange; the challenge goes into the
//! authorize URL so the provider can check the exchange came from the party
//! that started the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::OAuthConfig;
use crate::error::{Error, Result};

/// Verifier length. RFC 7636 allows 43-128.
pub const VERIFIER_LEN: usize = 64;

/// Length of the per-flow correlation nonce.
pub const STATE_LEN: usize = 32;

const CHARSET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest multiple of 62 that fits in a byte. Bytes at or above it are
/// discarded so `byte % 62` stays uniform.
const REJECT_AT: u8 = 248;

/// Generate a cryptographically random PKCE code verifier.
///
/// 64 characters drawn uniformly from `[A-Za-z0-9]`.
pub fn generate_verifier() -> String {
    random_alphanumeric(VERIFIER_LEN)
}

/// Generate a random nonce used to correlate a redirect with its flow.
pub fn generate_state() -> String {
    random_alphanumeric(STATE_LEN)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`, without padding.
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Build the authorize URL the user's browser is sent to.
///
/// `state` carries the host's callback URI: the relay named by
/// `config.redirect_uri` forwards the authorization response there.
pub fn build_authorization_url(
    config: &OAuthConfig,
    scopes: &[String],
    challenge: &str,
    state: &str,
) -> Result<Url> {
    let mut url = Url::parse(&config.authorize_endpoint).map_err(|e| {
        Error::InvalidConfig(format!(
            "authorize_endpoint {}: {e}",
            config.authorize_endpoint
        ))
    })?;
    url.query_pairs_mut()
        .clear()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("scope", &scopes.join(" "))
        .append_pair("code_challenge_method", "S256")
        .append_pair("code_challenge", challenge)
        .append_pair("state", state)
        .append_pair("redirect_uri", &config.redirect_uri);
    Ok(url)
}

fn random_alphanumeric(len: usize) -> String {
    let mut out = String::with_capacity(len);
    let mut rng = rand::rng();
    let mut buf = [0u8; 64];
    while out.len() < len {
        rng.fill(&mut buf);
        for byte in buf.iter().copied().filter(|b| *b < REJECT_AT) {
            out.push(CHARSET[(byte % 62) as usize] as char);
            if out.len() == len {
                break;
            }
        }
    }
    out
}
