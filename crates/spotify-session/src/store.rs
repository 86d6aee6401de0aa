//! Session storage on top of a host secret store
//!
//! All sessions live in one JSON array under a single secret key. Every
//! mutation rewrites the whole blob while holding the tokio Mutex, so
//! concurrent writers (interactive flows, background refresh, removals)
//! cannot interleave a read-modify-write.
//!
//! The in-memory list is the source of truth once loaded; the secret store
//! is only read at startup. A mutation only reaches memory after the write
//! succeeds, so a failed write leaves both sides as they were.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use spotify_auth::TokenResponse;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::{ScopeSet, Session};

/// Secret key the session blob is stored under.
pub const DEFAULT_STORAGE_KEY: &str = "tokens";

/// A host-provided string key/value store for secrets.
///
/// Methods return boxed futures so the store can sit behind `Arc<dyn SecretStorage>`.
pub trait SecretStorage: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// In-process secret storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemorySecretStorage {
    values: std::sync::Mutex<HashMap<String, String>>,
    writes: std::sync::atomic::AtomicUsize,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemorySecretStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `value` already stored under `key`.
    pub fn with_value(key: &str, value: impl Into<String>) -> Self {
        let storage = Self::default();
        storage.insert(key, value.into());
        storage
    }

    /// Number of `set` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Current value under `key`, bypassing the async interface.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Make every following `set` fail with a storage error.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    fn insert(&self, key: &str, value: String) {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value);
    }
}

impl SecretStorage for MemorySecretStorage {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.peek(key)) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            #[cfg(test)]
            if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(Error::Storage("disk full".into()));
            }
            self.insert(key, value);
            self.writes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        })
    }
}

/// The authoritative list of sessions.
pub struct SessionStore {
    storage: Arc<dyn SecretStorage>,
    key: String,
    sessions: Mutex<Vec<Session>>,
}

impl SessionStore {
    /// Load sessions from `storage` under `key`.
    ///
    /// A missing or blank value means no sessions. A value that is not a
    /// JSON array of sessions is an error rather than silently discarded.
    pub async fn load(storage: Arc<dyn SecretStorage>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let sessions = match storage.get(&key).await? {
            Some(blob) if !blob.trim().is_empty() => {
                let sessions: Vec<Session> = serde_json::from_str(&blob)
                    .map_err(|e| Error::SessionParse(format!("parsing stored sessions: {e}")))?;
                info!(key = %key, sessions = sessions.len(), "loaded sessions");
                sessions
            }
            _ => {
                info!(key = %key, "no stored sessions, starting empty");
                Vec::new()
            }
        };
        metrics::gauge!("auth_sessions").set(sessions.len() as f64);

        Ok(Self {
            storage,
            key,
            sessions: Mutex::new(sessions),
        })
    }

    /// Sessions in insertion order, optionally limited to those granted
    /// every scope in `filter`.
    pub async fn list(&self, filter: Option<&ScopeSet>) -> Vec<Session> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|s| filter.is_none_or(|f| s.covers(f)))
            .cloned()
            .collect()
    }

    /// First session (insertion order) that covers `scopes`.
    pub async fn find(&self, scopes: &ScopeSet) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions.iter().find(|s| s.covers(scopes)).cloned()
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions.iter().find(|s| s.id == id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions.iter().map(|s| s.id.clone()).collect()
    }

    /// Insert a session, or replace the one with the same id in place.
    pub async fn upsert(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let mut next = sessions.clone();
        match next.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => next.push(session),
        }
        self.persist(&next).await?;
        *sessions = next;
        Ok(())
    }

    /// Remove a session and persist. Unknown ids are a no-op that does not
    /// touch storage.
    pub async fn remove(&self, id: &str) -> Result<Option<Session>> {
        let mut sessions = self.sessions.lock().await;
        let Some(index) = sessions.iter().position(|s| s.id == id) else {
            return Ok(None);
        };
        let mut next = sessions.clone();
        let removed = next.remove(index);
        self.persist(&next).await?;
        *sessions = next;
        debug!(session_id = id, "removed session");
        Ok(Some(removed))
    }

    /// Apply a refresh response to an existing session and persist.
    pub async fn update_tokens(&self, id: &str, tokens: &TokenResponse) -> Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let mut next = sessions.clone();
        let session = next
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::NotFound(format!("session {id} not in store")))?;
        session.apply_refresh(tokens);
        let updated = session.clone();
        self.persist(&next).await?;
        *sessions = next;
        debug!(session_id = id, "updated tokens");
        Ok(updated)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write the full list. Callers hold the lock and swap `sessions` in
    /// only on success.
    async fn persist(&self, sessions: &[Session]) -> Result<()> {
        let blob = serde_json::to_string(sessions)
            .map_err(|e| Error::SessionParse(format!("serializing sessions: {e}")))?;
        self.storage.set(&self.key, blob).await?;
        metrics::gauge!("auth_sessions").set(sessions.len() as f64);
        debug!(key = %self.key, sessions = sessions.len(), "persisted sessions");
        Ok(())
    }
}
