//! Per-session background token refresh
//!
//! Each session gets one timer task that sleeps until two thirds of its
//! access token lifetime has passed, refreshes, and re-arms itself from the
//! new lifetime. Outcomes of a refresh attempt:
//! - success: store updated, `changed` published, re-armed from the new `expires_in`
//! - network failure: nothing changes, retried after `network_retry_delay`
//! - any other failure: the session is removed and `removed` published
//! - session already gone: the task ends quietly
//!
//! Arming a session that already has a timer replaces it. Tasks carry a
//! generation number so a finishing task never removes its replacement's
//! handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use spotify_auth::{OAuthConfig, ResilientHttpClient};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::notifier::{SessionChangeEvent, SessionChangeNotifier};
use crate::session::Session;
use crate::store::SessionStore;

/// When and how often to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Refresh after `numerator / denominator` of the token lifetime
    pub lifetime_numerator: u64,
    pub lifetime_denominator: u64,
    /// Wait before retrying after a network failure
    pub network_retry_delay: Duration,
    /// Floor for the computed delay, so a zero lifetime cannot spin
    pub min_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            lifetime_numerator: 2,
            lifetime_denominator: 3,
            network_retry_delay: Duration::from_secs(60),
            min_delay: Duration::from_secs(1),
        }
    }
}

impl RefreshPolicy {
    /// Delay before refreshing a token that lives `expires_in` seconds.
    pub fn delay_for(&self, expires_in: u64) -> Duration {
        let denominator = self.lifetime_denominator.max(1);
        let millis = expires_in
            .saturating_mul(1000)
            .saturating_mul(self.lifetime_numerator)
            / denominator;
        Duration::from_millis(millis).max(self.min_delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lifetime_denominator == 0
            || self.lifetime_numerator == 0
            || self.lifetime_numerator >= self.lifetime_denominator
        {
            return Err(spotify_auth::Error::InvalidConfig(format!(
                "refresh fraction {}/{} must be between 0 and 1",
                self.lifetime_numerator, self.lifetime_denominator
            ))
            .into());
        }
        Ok(())
    }
}

/// Result of one refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(Session),
    /// Transient failure; try again later
    Deferred,
    /// Rejected by the provider; the session was removed
    Invalidated(Error),
    /// The session no longer exists
    Gone,
}

struct TimerHandle {
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct Inner {
    store: Arc<SessionStore>,
    notifier: SessionChangeNotifier,
    http: ResilientHttpClient,
    config: Arc<OAuthConfig>,
    policy: RefreshPolicy,
    timers: Mutex<HashMap<String, TimerHandle>>,
    next_generation: AtomicU64,
    root: CancellationToken,
}

/// Owns one refresh timer per session.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    /// `parent` cancels every timer when it is cancelled.
    pub fn new(
        store: Arc<SessionStore>,
        notifier: SessionChangeNotifier,
        http: ResilientHttpClient,
        config: Arc<OAuthConfig>,
        policy: RefreshPolicy,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                notifier,
                http,
                config,
                policy,
                timers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                root: parent.child_token(),
            }),
        }
    }

    /// Start (or restart) the timer for `session_id`, firing after `delay`.
    pub fn arm(&self, session_id: &str, delay: Duration) {
        if self.inner.root.is_cancelled() {
            debug!(session_id, "scheduler shut down, not arming");
            return;
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.root.child_token();

        // Held across spawn so the task cannot finish before its handle is recorded
        let mut timers = self.inner.lock_timers();
        let join = tokio::spawn(run_timer(
            Arc::clone(&self.inner),
            session_id.to_string(),
            delay,
            cancel.clone(),
            generation,
        ));
        let previous = timers.insert(
            session_id.to_string(),
            TimerHandle {
                generation,
                cancel,
                join,
            },
        );
        drop(timers);

        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        debug!(session_id, delay_ms = delay.as_millis() as u64, "refresh armed");
    }

    /// Arm from the session's current token lifetime.
    pub fn arm_for(&self, session: &Session) {
        self.arm(&session.id, self.inner.policy.delay_for(session.expires_in));
    }

    /// Stop the timer for `session_id`. Returns whether one was armed.
    pub fn cancel(&self, session_id: &str) -> bool {
        let handle = self.inner.lock_timers().remove(session_id);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                debug!(session_id, "refresh cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, session_id: &str) -> bool {
        self.inner.lock_timers().contains_key(session_id)
    }

    pub fn armed_count(&self) -> usize {
        self.inner.lock_timers().len()
    }

    /// Refresh every stored session concurrently, then arm a timer for each
    /// survivor. Run once after loading persisted sessions, whose tokens
    /// may have expired while nothing was running.
    pub async fn prime(&self) {
        let ids = self.inner.store.ids().await;
        if ids.is_empty() {
            return;
        }
        info!(sessions = ids.len(), "refreshing stored sessions");
        let outcomes = join_all(ids.iter().map(|id| self.inner.refresh_once(id))).await;
        for (id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                RefreshOutcome::Refreshed(session) => self.arm_for(&session),
                RefreshOutcome::Deferred => self.arm(id, self.inner.policy.network_retry_delay),
                RefreshOutcome::Invalidated(_) | RefreshOutcome::Gone => {}
            }
        }
    }

    /// Cancel every timer and wait for the tasks to exit. Later `arm`
    /// calls are ignored.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        let handles: Vec<TimerHandle> = self
            .inner
            .lock_timers()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let count = handles.len();
        for handle in handles {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
        info!(timers = count, "refresh scheduler stopped");
    }
}

impl Inner {
    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, TimerHandle>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the handle for a timer that ended on its own, unless it has
    /// already been replaced.
    fn finish(&self, session_id: &str, generation: u64) {
        let mut timers = self.lock_timers();
        if timers
            .get(session_id)
            .is_some_and(|h| h.generation == generation)
        {
            timers.remove(session_id);
        }
    }

    async fn refresh_once(&self, session_id: &str) -> RefreshOutcome {
        let Some(session) = self.store.get(session_id).await else {
            debug!(session_id, "session gone, nothing to refresh");
            return RefreshOutcome::Gone;
        };

        match spotify_auth::refresh_token(&self.http, &self.config, &session.refresh_token).await {
            Ok(tokens) => {
                let updated = match self.store.update_tokens(session_id, &tokens).await {
                    Ok(updated) => updated,
                    Err(Error::NotFound(_)) => return RefreshOutcome::Gone,
                    Err(e) => {
                        // The store kept the previous tokens; try again on the retry delay
                        metrics::counter!("auth_refresh_total", "outcome" => "deferred")
                            .increment(1);
                        error!(
                            session_id,
                            error = %e,
                            "failed to persist refreshed tokens, will retry"
                        );
                        return RefreshOutcome::Deferred;
                    }
                };
                metrics::counter!("auth_refresh_total", "outcome" => "refreshed").increment(1);
                info!(session_id, expires_in = updated.expires_in, "session refreshed");
                self.notifier
                    .notify(&SessionChangeEvent::changed(updated.clone()));
                RefreshOutcome::Refreshed(updated)
            }
            Err(e) if e.is_transient() => {
                metrics::counter!("auth_refresh_total", "outcome" => "deferred").increment(1);
                warn!(
                    session_id,
                    error = %e,
                    retry_in_secs = self.policy.network_retry_delay.as_secs(),
                    "refresh failed (network), will retry"
                );
                RefreshOutcome::Deferred
            }
            Err(e) => {
                match self.store.remove(session_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => return RefreshOutcome::Gone,
                    Err(persist) => {
                        // Still stored, so keep the timer and try the removal again later
                        metrics::counter!("auth_refresh_total", "outcome" => "deferred")
                            .increment(1);
                        error!(
                            session_id,
                            error = %e,
                            persist_error = %persist,
                            "refresh rejected but removal could not be persisted, will retry"
                        );
                        return RefreshOutcome::Deferred;
                    }
                }
                metrics::counter!("auth_refresh_total", "outcome" => "invalidated").increment(1);
                error!(session_id, error = %e, "refresh rejected, session removed");
                self.notifier.notify(&SessionChangeEvent::removed(session));
                RefreshOutcome::Invalidated(Error::Auth(e))
            }
        }
    }
}

async fn run_timer(
    inner: Arc<Inner>,
    session_id: String,
    mut delay: Duration,
    cancel: CancellationToken,
    generation: u64,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = inner.refresh_once(&session_id) => outcome,
        };
        delay = match outcome {
            RefreshOutcome::Refreshed(session) => inner.policy.delay_for(session.expires_in),
            RefreshOutcome::Deferred => inner.policy.network_retry_delay,
            RefreshOutcome::Invalidated(_) | RefreshOutcome::Gone => break,
        };
        debug!(session_id, delay_ms = delay.as_millis() as u64, "refresh re-armed");
    }
    inner.finish(&session_id, generation);
}
