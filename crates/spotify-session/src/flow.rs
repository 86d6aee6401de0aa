//! Interactive authorization-code flow with PKCE
//!
//! One flow per scope set: concurrent requests for the same `ScopeSet` join
//! the flow already running instead of opening a second browser window.
//! Each flow runs in its own task, so a caller that stops waiting does not
//! abort the login for everyone else.
//!
//! Flow stages:
//! 1. Generate verifier, challenge, and a nonce-tagged callback `state`
//! 2. Open the authorize URL in the browser
//! 3. Wait for the redirect (bounded by timeout and cancellation)
//! 4. Exchange the code, fetch the profile, store the session
//!
//! Nothing is committed to the store until stage 4 succeeds.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::Secret;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use spotify_auth::{
    OAuthConfig, ResilientHttpClient, TokenResponse, UserInfo, build_authorization_url,
    compute_challenge, generate_state, generate_verifier,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::notifier::{SessionChangeEvent, SessionChangeNotifier};
use crate::scheduler::RefreshScheduler;
use crate::session::{ScopeSet, Session};
use crate::store::SessionStore;

/// Query parameter on the callback URI that ties a redirect to its flow.
pub const NONCE_PARAM: &str = "nonce";

/// Default bound on the wait for the user to finish in the browser.
pub const DEFAULT_REDIRECT_TIMEOUT: Duration = Duration::from_secs(600);

/// Waits for the OAuth redirect to reach this host.
pub trait RedirectWaiter: Send + Sync {
    /// Resolve with the full callback URL carrying `nonce`. Dropping the
    /// future abandons the wait.
    fn wait_for_callback<'a>(
        &'a self,
        nonce: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Url>> + Send + 'a>>;
}

/// Shows the authorize URL to the user.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &Url) -> Result<()>;
}

/// Stage of one flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingRedirect,
    Exchanging,
    Complete,
    Failed,
}

impl FlowState {
    /// Legal transitions. `Failed` is reachable from every non-terminal state.
    pub fn can_advance_to(self, next: FlowState) -> bool {
        use FlowState::*;
        matches!(
            (self, next),
            (Idle, AwaitingRedirect)
                | (AwaitingRedirect, Exchanging)
                | (Exchanging, Complete)
                | (Idle | AwaitingRedirect | Exchanging, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Complete | FlowState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::AwaitingRedirect => "awaiting_redirect",
            FlowState::Exchanging => "exchanging",
            FlowState::Complete => "complete",
            FlowState::Failed => "failed",
        }
    }
}

/// Per-flow secrets. Lives only as long as one run.
#[derive(Debug)]
pub struct PendingAuthorization {
    /// Callback URI with the nonce appended; sent as OAuth `state`
    pub state: String,
    pub nonce: String,
    pub code_verifier: Secret<String>,
    pub scopes: ScopeSet,
}

impl PendingAuthorization {
    pub fn new(callback_uri: &str, scopes: ScopeSet) -> Result<Self> {
        let nonce = generate_state();
        let mut state = Url::parse(callback_uri).map_err(|e| {
            spotify_auth::Error::InvalidConfig(format!("callback_uri {callback_uri}: {e}"))
        })?;
        state.query_pairs_mut().append_pair(NONCE_PARAM, &nonce);
        Ok(Self {
            state: state.into(),
            nonce,
            code_verifier: Secret::new(generate_verifier()),
            scopes,
        })
    }
}

/// Pull the authorization code out of a callback URL.
///
/// An OAuth `error` parameter wins over a code.
pub fn extract_code(callback: &Url) -> Result<String> {
    let mut code = None;
    for (key, value) in callback.query_pairs() {
        match key.as_ref() {
            "error" => return Err(Error::AccessDenied(value.into_owned())),
            "code" if !value.is_empty() => code = Some(value.into_owned()),
            _ => {}
        }
    }
    code.ok_or(Error::MissingAuthorizationCode)
}

/// Snapshot of a running flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStatus {
    pub scopes: String,
    pub state: FlowState,
}

/// Everything a flow needs to turn a code into a stored session.
pub struct FlowContext {
    pub config: Arc<OAuthConfig>,
    pub http: ResilientHttpClient,
    pub store: Arc<SessionStore>,
    pub notifier: SessionChangeNotifier,
    pub scheduler: RefreshScheduler,
    pub redirect: Arc<dyn RedirectWaiter>,
    pub browser: Arc<dyn BrowserOpener>,
    pub redirect_timeout: Duration,
}

type SharedResult = Shared<BoxFuture<'static, Result<Session>>>;

struct InFlight {
    id: u64,
    result: SharedResult,
    cancel: CancellationToken,
    state: Arc<Mutex<FlowState>>,
}

struct Inner {
    ctx: FlowContext,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
    root: CancellationToken,
}

/// Runs authorization flows, at most one per scope set at a time.
#[derive(Clone)]
pub struct AuthorizationFlowCoordinator {
    inner: Arc<Inner>,
}

impl AuthorizationFlowCoordinator {
    /// Flows are cancelled when `parent` is.
    pub fn new(ctx: FlowContext, parent: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                root: parent.child_token(),
            }),
        }
    }

    /// Run (or join) the flow for `scopes` and return the new session.
    ///
    /// Resolves to the first stored session covering `scopes` without a
    /// browser round trip when there already is one.
    pub async fn create_session(&self, scopes: ScopeSet) -> Result<Session> {
        let result = self.start_or_join(scopes)?;
        result.await
    }

    fn start_or_join(&self, scopes: ScopeSet) -> Result<SharedResult> {
        let key = scopes.key();
        let mut in_flight = self.inner.lock_in_flight();
        if let Some(existing) = in_flight.get(&key) {
            debug!(scopes = %key, "joining in-flight authorization");
            return Ok(existing.result.clone());
        }
        if self.inner.root.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.root.child_token();
        let state = Arc::new(Mutex::new(FlowState::Idle));
        let task = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            let state = Arc::clone(&state);
            let key = key.clone();
            async move {
                let result = inner.run(scopes, &cancel, &state).await;
                inner.finish(&key, id);
                result
            }
        });
        let result = async move {
            task.await
                .unwrap_or_else(|e| Err(Error::Internal(format!("authorization task: {e}"))))
        }
        .boxed()
        .shared();

        in_flight.insert(
            key,
            InFlight {
                id,
                result: result.clone(),
                cancel,
                state,
            },
        );
        Ok(result)
    }

    /// Cancel the running flow for `scopes`. Returns whether one was running.
    pub fn cancel_pending(&self, scopes: &ScopeSet) -> bool {
        let in_flight = self.inner.lock_in_flight();
        match in_flight.get(&scopes.key()) {
            Some(flow) => {
                flow.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running flow. Returns how many were running.
    pub fn cancel_all(&self) -> usize {
        let in_flight = self.inner.lock_in_flight();
        for flow in in_flight.values() {
            flow.cancel.cancel();
        }
        in_flight.len()
    }

    /// Running flows, sorted by scope key.
    pub fn in_flight(&self) -> Vec<FlowStatus> {
        let in_flight = self.inner.lock_in_flight();
        let mut flows: Vec<FlowStatus> = in_flight
            .iter()
            .map(|(key, flow)| FlowStatus {
                scopes: key.clone(),
                state: *flow.state.lock().unwrap_or_else(PoisonError::into_inner),
            })
            .collect();
        flows.sort_by(|a, b| a.scopes.cmp(&b.scopes));
        flows
    }

    /// Cancel every flow and stop accepting new ones.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            info!(flows = cancelled, "cancelled pending authorizations");
        }
    }
}

impl Inner {
    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, key: &str, id: u64) {
        let mut in_flight = self.lock_in_flight();
        if in_flight.get(key).is_some_and(|flow| flow.id == id) {
            in_flight.remove(key);
        }
    }

    async fn run(
        &self,
        scopes: ScopeSet,
        cancel: &CancellationToken,
        state: &Mutex<FlowState>,
    ) -> Result<Session> {
        let key = scopes.key();
        // A flow that finished just before this one started may already cover the scopes
        if let Some(existing) = self.ctx.store.find(&scopes).await {
            metrics::counter!("auth_flows_total", "outcome" => "existing").increment(1);
            debug!(scopes = %key, session_id = %existing.id, "stored session already covers scopes");
            return Ok(existing);
        }
        let result = self.drive(scopes, cancel, state).await;
        match &result {
            Ok(session) => {
                advance(state, &key, FlowState::Complete);
                metrics::counter!("auth_flows_total", "outcome" => "complete").increment(1);
                info!(
                    scopes = %key,
                    session_id = %session.id,
                    account = %session.account.label,
                    "authorization complete"
                );
            }
            Err(e) => {
                advance(state, &key, FlowState::Failed);
                metrics::counter!("auth_flows_total", "outcome" => e.kind()).increment(1);
                warn!(scopes = %key, error = %e, "authorization failed");
            }
        }
        result
    }

    async fn drive(
        &self,
        scopes: ScopeSet,
        cancel: &CancellationToken,
        state: &Mutex<FlowState>,
    ) -> Result<Session> {
        let pending = PendingAuthorization::new(&self.ctx.config.callback_uri, scopes)?;
        let key = pending.scopes.key();

        let (tokens, user) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            acquired = self.acquire(&pending, state) => acquired?,
        };

        // Past this point the flow commits even if cancelled
        let session = Session::new(&pending.scopes, tokens, &user)?;
        self.ctx.store.upsert(session.clone()).await?;
        self.ctx
            .notifier
            .notify(&SessionChangeEvent::added(session.clone()));
        self.ctx.scheduler.arm_for(&session);
        debug!(scopes = %key, session_id = %session.id, "session stored");
        Ok(session)
    }

    /// Browser, redirect, code exchange, and profile lookup.
    async fn acquire(
        &self,
        pending: &PendingAuthorization,
        state: &Mutex<FlowState>,
    ) -> Result<(TokenResponse, UserInfo)> {
        let ctx = &self.ctx;
        let key = pending.scopes.key();
        let challenge = compute_challenge(pending.code_verifier.expose());
        let url = build_authorization_url(
            &ctx.config,
            &pending.scopes.to_vec(),
            &challenge,
            &pending.state,
        )?;

        // Registered before the browser opens so a fast redirect is not missed
        let redirect = ctx.redirect.wait_for_callback(&pending.nonce);
        ctx.browser.open(&url)?;
        advance(state, &key, FlowState::AwaitingRedirect);
        info!(scopes = %key, "waiting for authorization redirect");

        let callback = tokio::time::timeout(ctx.redirect_timeout, redirect)
            .await
            .map_err(|_| Error::RedirectTimeout(ctx.redirect_timeout.as_secs()))??;
        let code = extract_code(&callback)?;

        advance(state, &key, FlowState::Exchanging);
        let verifier = pending.code_verifier.expose();
        let tokens = spotify_auth::exchange_code(&ctx.http, &ctx.config, &code, verifier).await?;
        let user =
            spotify_auth::fetch_user_info(&ctx.http, &ctx.config, &tokens.access_token).await?;
        Ok((tokens, user))
    }
}

fn advance(state: &Mutex<FlowState>, key: &str, next: FlowState) {
    let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
    if !current.can_advance_to(next) {
        warn!(
            scopes = key,
            from = current.as_str(),
            to = next.as_str(),
            "rejected illegal flow transition"
        );
        return;
    }
    debug!(scopes = key, from = current.as_str(), to = next.as_str(), "flow transition");
    *current = next;
}
