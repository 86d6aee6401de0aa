//! `AuthProvider`: the session API consumers talk to
//!
//! Wires the store, notifier, refresh scheduler, and flow coordinator
//! together over host-supplied collaborators. Owns a root cancellation
//! token; `shutdown()` (or dropping the provider) cancels every flow and
//! refresh timer hanging off it.

use std::sync::Arc;
use std::time::Duration;

use spotify_auth::{OAuthConfig, ResilientHttpClient, RetryPolicy, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::flow::{
    AuthorizationFlowCoordinator, BrowserOpener, DEFAULT_REDIRECT_TIMEOUT, FlowContext,
    FlowStatus, RedirectWaiter,
};
use crate::notifier::{SessionChangeEvent, SessionChangeNotifier, Subscription};
use crate::scheduler::{RefreshPolicy, RefreshScheduler};
use crate::session::{ScopeSet, Session};
use crate::store::{DEFAULT_STORAGE_KEY, SecretStorage, SessionStore};

/// Tunables for one provider instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub oauth: OAuthConfig,
    pub retry: RetryPolicy,
    pub refresh: RefreshPolicy,
    pub redirect_timeout: Duration,
    /// Secret key the session list is stored under
    pub storage_key: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            oauth: OAuthConfig::default(),
            retry: RetryPolicy::default(),
            refresh: RefreshPolicy::default(),
            redirect_timeout: DEFAULT_REDIRECT_TIMEOUT,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

/// Host services the provider depends on.
pub struct Collaborators {
    pub storage: Arc<dyn SecretStorage>,
    pub redirect: Arc<dyn RedirectWaiter>,
    pub browser: Arc<dyn BrowserOpener>,
    pub transport: Arc<dyn Transport>,
}

pub struct AuthProvider {
    store: Arc<SessionStore>,
    notifier: SessionChangeNotifier,
    scheduler: RefreshScheduler,
    flows: AuthorizationFlowCoordinator,
    root: CancellationToken,
}

impl AuthProvider {
    pub const ID: &'static str = "spotify";
    pub const LABEL: &'static str = "Spotify";

    /// Load stored sessions, refresh each of them, and arm their timers.
    ///
    /// Sessions whose refresh is rejected are dropped before this returns.
    pub async fn initialize(config: ProviderConfig, collaborators: Collaborators) -> Result<Self> {
        config.oauth.validate()?;
        config.refresh.validate()?;

        let root = CancellationToken::new();
        let store = Arc::new(SessionStore::load(collaborators.storage, config.storage_key).await?);
        let notifier = SessionChangeNotifier::new();
        let http = ResilientHttpClient::new(collaborators.transport, config.retry);
        let oauth = Arc::new(config.oauth);

        let scheduler = RefreshScheduler::new(
            Arc::clone(&store),
            notifier.clone(),
            http.clone(),
            Arc::clone(&oauth),
            config.refresh,
            &root,
        );
        let flows = AuthorizationFlowCoordinator::new(
            FlowContext {
                config: oauth,
                http,
                store: Arc::clone(&store),
                notifier: notifier.clone(),
                scheduler: scheduler.clone(),
                redirect: collaborators.redirect,
                browser: collaborators.browser,
                redirect_timeout: config.redirect_timeout,
            },
            &root,
        );

        scheduler.prime().await;
        info!(
            sessions = store.len().await,
            timers = scheduler.armed_count(),
            "auth provider initialized"
        );

        Ok(Self {
            store,
            notifier,
            scheduler,
            flows,
            root,
        })
    }

    /// Stored sessions, optionally only those granted every scope in `filter`.
    pub async fn get_sessions(&self, filter: Option<&ScopeSet>) -> Vec<Session> {
        self.store.list(filter).await
    }

    /// First stored session covering `scopes`. With `create_if_none`, runs
    /// the interactive flow when there is none.
    pub async fn get_session(
        &self,
        scopes: &ScopeSet,
        create_if_none: bool,
    ) -> Result<Option<Session>> {
        if let Some(session) = self.store.find(scopes).await {
            return Ok(Some(session));
        }
        if !create_if_none {
            return Ok(None);
        }
        self.create_session(scopes.clone()).await.map(Some)
    }

    /// Sign in for `scopes`. A stored session that already covers them is
    /// returned as is, without opening the browser.
    pub async fn create_session(&self, scopes: ScopeSet) -> Result<Session> {
        self.flows.create_session(scopes).await
    }

    /// Sign a session out. Unknown ids are ignored and publish nothing.
    ///
    /// If the removal cannot be persisted the session stays stored with its
    /// refresh timer armed.
    pub async fn remove_session(&self, id: &str) -> Result<()> {
        match self.store.remove(id).await? {
            Some(removed) => {
                self.scheduler.cancel(id);
                info!(session_id = id, account = %removed.account.label, "session removed");
                self.notifier.notify(&SessionChangeEvent::removed(removed));
            }
            None => debug!(session_id = id, "remove for unknown session ignored"),
        }
        Ok(())
    }

    /// Current access token for `scopes`, signing in first if needed.
    pub async fn access_token(&self, scopes: &ScopeSet) -> Result<String> {
        self.get_session(scopes, true)
            .await?
            .map(|session| session.access_token)
            .ok_or_else(|| Error::NoMatchingSession(scopes.key()))
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(listener)
    }

    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<SessionChangeEvent>) {
        self.notifier.subscribe_channel()
    }

    /// Cancel every interactive flow in progress. Returns how many there were.
    pub fn cancel_pending_flows(&self) -> usize {
        self.flows.cancel_all()
    }

    pub fn pending_flows(&self) -> Vec<FlowStatus> {
        self.flows.in_flight()
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    /// Cancel all flows and refresh timers and wait for the timers to stop.
    pub async fn shutdown(&self) {
        self.flows.shutdown();
        self.scheduler.shutdown().await;
        self.root.cancel();
        info!("auth provider shut down");
    }
}

impl Drop for AuthProvider {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
