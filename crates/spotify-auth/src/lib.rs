//! Spotify OAuth client library
//!
//! PKCE generation, a retrying HTTP layer, and the token/user-info endpoint
//! calls for the authorization-code flow. Session bookkeeping lives in
//! `spotify-session`; this crate holds no state beyond its configuration.
//!
//! Credential flow:
//! 1. `pkce::generate_verifier()` + `pkce::compute_challenge()`
//! 2. User authorizes via `pkce::build_authorization_url()`
//! 3. `token::exchange_code()` with the code from the redirect
//! 4. `token::fetch_user_info()` labels the new session
//! 5. `token::refresh_token()` keeps it alive

pub mod config;
pub mod error;
pub mod http;
pub mod pkce;
pub mod token;

pub use config::*;
pub use error::{Error, Result};
pub use http::{
    HttpRequest, HttpResponse, Method, ReqwestTransport, ResilientHttpClient, RetryPolicy,
    Transport,
};
pub use pkce::{build_authorization_url, compute_challenge, generate_state, generate_verifier};
pub use token::{TokenResponse, UserInfo, exchange_code, fetch_user_info, refresh_token};
