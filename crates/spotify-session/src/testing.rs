//! Test doubles shared by the crate's unit tests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spotify_auth::{HttpRequest, HttpResponse, RetryPolicy, Transport};
use url::Url;

use crate::error::{Error, Result};
use crate::flow::{BrowserOpener, RedirectWaiter};
use crate::session::{Account, Session};

/// Build a session with predictable tokens: `at_<id>` / `rt_<id>`.
pub(crate) fn session(id: &str, scopes: &[&str], expires_in: u64) -> Session {
    Session {
        id: id.into(),
        access_token: format!("at_{id}"),
        refresh_token: format!("rt_{id}"),
        expires_in,
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        account: Account {
            id: "u1".into(),
            label: "Ada".into(),
        },
    }
}

pub(crate) fn ok(body: &str) -> spotify_auth::Result<HttpResponse> {
    Ok(HttpResponse::new(200, body))
}

pub(crate) fn status(code: u16, body: &str) -> spotify_auth::Result<HttpResponse> {
    Ok(HttpResponse::new(code, body))
}

pub(crate) fn network() -> spotify_auth::Result<HttpResponse> {
    Err(spotify_auth::Error::Network("connection reset".into()))
}

/// No retries, so one scripted response is consumed per logical call.
pub(crate) fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    }
}

/// Scripted token/profile endpoint. Requests are routed by grant type:
/// code exchange, refresh, or (no form) the profile lookup.
#[derive(Default)]
pub(crate) struct MockEndpoints {
    exchange: Mutex<VecDeque<spotify_auth::Result<HttpResponse>>>,
    refresh: Mutex<VecDeque<spotify_auth::Result<HttpResponse>>>,
    profile: Mutex<VecDeque<spotify_auth::Result<HttpResponse>>>,
    pub(crate) requests: Mutex<Vec<(tokio::time::Instant, HttpRequest)>>,
}

impl MockEndpoints {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_exchange(&self, response: spotify_auth::Result<HttpResponse>) {
        self.exchange.lock().unwrap().push_back(response);
    }

    pub(crate) fn push_refresh(&self, response: spotify_auth::Result<HttpResponse>) {
        self.refresh.lock().unwrap().push_back(response);
    }

    pub(crate) fn push_profile(&self, response: spotify_auth::Result<HttpResponse>) {
        self.profile.lock().unwrap().push_back(response);
    }

    /// Script one successful interactive login: AT1/RT1/3600 for u1 "Ada".
    pub(crate) fn script_login(&self) {
        self.push_exchange(ok(
            r#"{"access_token":"AT1","refresh_token":"RT1","expires_in":3600}"#,
        ));
        self.push_profile(ok(r#"{"id":"u1","display_name":"Ada"}"#));
    }

    /// Requests carrying `grant_type=<grant>`.
    pub(crate) fn grants(&self, grant: &str) -> Vec<(tokio::time::Instant, HttpRequest)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.form_value("grant_type") == Some(grant))
            .cloned()
            .collect()
    }

    pub(crate) fn refresh_count(&self) -> usize {
        self.grants("refresh_token").len()
    }
}

impl Transport for MockEndpoints {
    fn execute<'a>(
        &'a self,
        request: &'a HttpRequest,
    ) -> Pin<Box<dyn Future<Output = spotify_auth::Result<HttpResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap()
                .push((tokio::time::Instant::now(), request.clone()));
            let queue = match request.form_value("grant_type") {
                Some("authorization_code") => &self.exchange,
                Some("refresh_token") => &self.refresh,
                _ => &self.profile,
            };
            let next = queue.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(spotify_auth::Error::Network("nothing scripted".into())))
        })
    }
}

/// Answers every wait with `<callback>?nonce=<nonce>&<query>` after `delay`,
/// recording the nonces it was asked for.
pub(crate) struct ScriptedRedirect {
    pub(crate) query: String,
    pub(crate) delay: Duration,
    pub(crate) nonces: Mutex<Vec<String>>,
}

impl ScriptedRedirect {
    pub(crate) fn new(query: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            query: query.into(),
            delay,
            nonces: Mutex::new(Vec::new()),
        })
    }

    /// Approves immediately with `code=abc123`.
    pub(crate) fn approve() -> Arc<Self> {
        Self::new("code=abc123", Duration::ZERO)
    }
}

impl RedirectWaiter for ScriptedRedirect {
    fn wait_for_callback<'a>(
        &'a self,
        nonce: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Url>> + Send + 'a>> {
        Box::pin(async move {
            self.nonces.lock().unwrap().push(nonce.to_string());
            tokio::time::sleep(self.delay).await;
            let raw = format!(
                "{}?nonce={nonce}&{}",
                spotify_auth::DEFAULT_CALLBACK_URI,
                self.query
            );
            Url::parse(&raw).map_err(|e| Error::RedirectClosed(e.to_string()))
        })
    }
}

/// A redirect that never arrives.
pub(crate) struct NeverRedirect;

impl RedirectWaiter for NeverRedirect {
    fn wait_for_callback<'a>(
        &'a self,
        _nonce: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Url>> + Send + 'a>> {
        Box::pin(std::future::pending())
    }
}

/// Records every URL it is asked to open.
#[derive(Default)]
pub(crate) struct RecordingBrowser {
    pub(crate) opened: Mutex<Vec<Url>>,
}

impl RecordingBrowser {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub(crate) fn last_param(&self, key: &str) -> Option<String> {
        let opened = self.opened.lock().unwrap();
        opened.last().and_then(|url| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        })
    }
}

impl BrowserOpener for RecordingBrowser {
    fn open(&self, url: &Url) -> Result<()> {
        self.opened.lock().unwrap().push(url.clone());
        Ok(())
    }
}
