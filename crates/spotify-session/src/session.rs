//! Session and scope-set types
//!
//! A `Session` is the unit persisted to secret storage and handed to
//! consumers. The persisted field names are camelCase so blobs written by
//! earlier hosts load unchanged.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use spotify_auth::{TokenResponse, UserInfo};

use crate::error::{Error, Result};

/// A normalized set of OAuth scopes.
///
/// Order and duplicates in the input do not matter: `["b", "a", "a"]` and
/// `["a", "b"]` produce the same set and the same `key()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// Build a scope set. Entries are split on whitespace, so a single
    /// space-joined string is accepted too. At least one scope is required.
    pub fn new<I, S>(scopes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = scopes
            .into_iter()
            .flat_map(|s| {
                s.as_ref()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        if set.is_empty() {
            return Err(Error::InvalidScopes("at least one scope is required".into()));
        }
        Ok(Self(set))
    }

    /// Parse a comma- or space-separated list, as found in query strings.
    pub fn parse(list: &str) -> Result<Self> {
        Self::new(list.split(','))
    }

    /// Canonical single-string form: sorted, space-joined.
    pub fn key(&self) -> String {
        self.to_vec().join(" ")
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every scope here appears in `granted`.
    pub fn is_subset_of(&self, granted: &[String]) -> bool {
        self.0.iter().all(|scope| granted.iter().any(|g| g == scope))
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// The account a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub label: String,
}

/// One authorized session.
///
/// `id` is assigned once at creation and never changes, even when refreshes
/// rotate both tokens.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime in seconds of the current access token, as last reported
    pub expires_in: u64,
    pub scopes: Vec<String>,
    pub account: Account,
}

impl Session {
    /// Build a new session from a completed code exchange.
    ///
    /// Fails when the exchange did not return a refresh token: a session
    /// that cannot be refreshed would silently die at expiry.
    pub fn new(scopes: &ScopeSet, tokens: TokenResponse, user: &UserInfo) -> Result<Self> {
        let refresh_token = tokens
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or(Error::MissingRefreshToken)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            access_token: tokens.access_token,
            refresh_token,
            expires_in: tokens.expires_in,
            scopes: scopes.to_vec(),
            account: Account {
                id: user.id.clone(),
                label: user.label(),
            },
        })
    }

    /// Whether this session was granted every scope in `filter`.
    pub fn covers(&self, filter: &ScopeSet) -> bool {
        filter.is_subset_of(&self.scopes)
    }

    /// Apply a refresh response. Keeps the old refresh token when the
    /// provider did not rotate it. Identity, scopes, and account stay fixed.
    pub fn apply_refresh(&mut self, tokens: &TokenResponse) {
        self.access_token = tokens.access_token.clone();
        if let Some(rotated) = tokens.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            self.refresh_token = rotated.to_string();
        }
        self.expires_in = tokens.expires_in;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .field("account", &self.account)
            .finish()
    }
}
