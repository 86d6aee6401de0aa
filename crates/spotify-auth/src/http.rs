//! Resilient HTTP layer for OAuth calls
//!
//! Every outbound call (code exchange, token refresh, user info) goes through
//! `ResilientHttpClient`, which bounds each attempt with a hard timeout,
//! classifies the outcome, and retries only transient failures:
//!
//! - timeout, connection failure, unreadable body, malformed JSON → `Network`, retried
//! - non-2xx status → `Server { status, body }`, returned immediately
//! - anything else (unbuildable request) → `Request`, returned immediately
//!
//! The wire itself sits behind the `Transport` trait so the retry policy can
//! be driven by scripted transports in tests. `ReqwestTransport` is the
//! production implementation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// HTTP methods the OAuth endpoints need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One logical request. Cloned per attempt by transports that need ownership.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when present
    pub bearer: Option<String>,
    /// Sent as an `application/x-www-form-urlencoded` body when non-empty
    pub form: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            bearer: None,
            form: Vec::new(),
        }
    }

    pub fn post_form(url: impl Into<String>, form: &[(&str, &str)]) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            bearer: None,
            form: form
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Value of a form field, if present.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// Form values and the bearer token are credentials; only field names are printed.
impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<&str> = self.form.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .field("form_fields", &fields)
            .finish()
    }
}

/// Raw response as seen by the retry layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A single network round trip, with no retry or timeout of its own.
///
/// Implementations classify their own failures: transport-level problems
/// become `Error::Network`, unbuildable requests become `Error::Request`.
/// Uses `Pin<Box<dyn Future>>` so the client can hold `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: &'a HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>>;
}

/// `Transport` backed by a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn execute<'a>(
        &'a self,
        request: &'a HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = match request.method {
                Method::Get => self.client.get(&request.url),
                Method::Post => self.client.post(&request.url),
            };
            if let Some(token) = &request.bearer {
                builder = builder.bearer_auth(token);
            }
            if !request.form.is_empty() {
                builder = builder.form(&request.form);
            }

            let response = builder.send().await.map_err(classify_reqwest)?;
            let status = response.status();
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) if status.is_success() => {
                    return Err(Error::Network(format!("reading response body: {e}")));
                }
                Err(_) => String::from("<no body>"),
            };
            Ok(HttpResponse {
                status: status.as_u16(),
                body,
            })
        })
    }
}

fn classify_reqwest(e: reqwest::Error) -> Error {
    if e.is_builder() || e.is_redirect() {
        Error::Request(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

/// Timeout and retry settings for `ResilientHttpClient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Hard limit on a single attempt
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before retry `n` is `base_delay * 2^n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Timeout + classification + bounded exponential backoff around a `Transport`.
#[derive(Clone)]
pub struct ResilientHttpClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl ResilientHttpClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn from_reqwest(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self::new(Arc::new(ReqwestTransport::new(client)), policy)
    }

    /// Send `request` and decode a 2xx JSON body as `T`, retrying transient failures.
    ///
    /// Returns the last `Network` error once retries are exhausted. `Server`
    /// and `Request` errors are returned from the attempt that produced them.
    pub async fn send_json<T: DeserializeOwned>(&self, request: &HttpRequest) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match self.attempt_json(request).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(url = %request.url, attempts = attempt + 1, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(Error::Network(reason)) if attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        url = %request.url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "transient failure, retrying"
                    );
                    metrics::counter!("auth_http_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(url = %request.url, attempts = attempt + 1, error = %e, "retries exhausted");
                    }
                    metrics::counter!("auth_http_failures_total", "kind" => failure_kind(&e))
                        .increment(1);
                    return Err(e);
                }
            }
        }
    }

    async fn attempt_json<T: DeserializeOwned>(&self, request: &HttpRequest) -> Result<T> {
        let response = tokio::time::timeout(self.policy.timeout, self.transport.execute(request))
            .await
            .map_err(|_| {
                Error::Network(format!(
                    "no response within {}ms",
                    self.policy.timeout.as_millis()
                ))
            })??;

        if !response.is_success() {
            return Err(Error::Server {
                status: response.status,
                body: response.body,
            });
        }

        serde_json::from_str(&response.body)
            .map_err(|e| Error::Network(format!("malformed response body: {e}")))
    }
}

fn failure_kind(e: &Error) -> &'static str {
    match e {
        Error::Network(_) => "network",
        Error::Server { .. } => "server",
        Error::Request(_) => "request",
        Error::InvalidConfig(_) => "config",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Ping {
        ok: bool,
    }

    /// Replays a fixed list of outcomes and records when each attempt happened.
    pub(crate) struct ScriptedTransport {
        script: Mutex<VecDeque<Result<HttpResponse>>>,
        pub(crate) calls: Mutex<Vec<(Instant, HttpRequest)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(script: Vec<Result<HttpResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Transport for ScriptedTransport {
        fn execute<'a>(
            &'a self,
            request: &'a HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), request.clone()));
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Network("script exhausted".into())));
            Box::pin(async move { next })
        }
    }

    /// Never answers.
    struct HangingTransport;

    impl Transport for HangingTransport {
        fn execute<'a>(
            &'a self,
            _request: &'a HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    fn ok_body() -> Result<HttpResponse> {
        Ok(HttpResponse::new(200, r#"{"ok":true}"#))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_network_errors_with_exponential_backoff() {
        let transport = ScriptedTransport::new(vec![
            Err(Error::Network("connection reset".into())),
            Err(Error::Network("connection reset".into())),
            ok_body(),
        ]);
        let client = ResilientHttpClient::new(transport.clone(), RetryPolicy::default());

        let start = Instant::now();
        let ping: Ping = client
            .send_json(&HttpRequest::get("https://example.test/ping"))
            .await
            .unwrap();

        assert_eq!(ping, Ping { ok: true });
        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 3, "success must come on the third attempt");
        assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(1));
        assert_eq!(calls[2].0 - calls[1].0, Duration::from_secs(2));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(401, r#"{"error":"invalid_client"}"#)),
            ok_body(),
        ]);
        let client = ResilientHttpClient::new(transport.clone(), RetryPolicy::default());

        let start = Instant::now();
        let err = client
            .send_json::<Ping>(&HttpRequest::get("https://example.test/ping"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::Server {
                status: 401,
                body: r#"{"error":"invalid_client"}"#.into()
            }
        );
        assert_eq!(transport.call_count(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_network_error() {
        let transport = ScriptedTransport::new(vec![]);
        let client = ResilientHttpClient::new(transport.clone(), RetryPolicy::default());

        let start = Instant::now();
        let err = client
            .send_json::<Ping>(&HttpRequest::get("https://example.test/ping"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Network(_)));
        assert_eq!(transport.call_count(), 4, "one attempt plus three retries");
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_body_is_treated_as_transient() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(200, "<html>gateway</html>")),
            ok_body(),
        ]);
        let client = ResilientHttpClient::new(transport.clone(), RetryPolicy::default());

        let ping: Ping = client
            .send_json(&HttpRequest::get("https://example.test/ping"))
            .await
            .unwrap();
        assert!(ping.ok);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn request_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(Error::Request("relative URL without a base".into())),
            ok_body(),
        ]);
        let client = ResilientHttpClient::new(transport.clone(), RetryPolicy::default());

        let err = client
            .send_json::<Ping>(&HttpRequest::get("/ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Request(_)));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_times_out_as_network_error() {
        let policy = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        let client = ResilientHttpClient::new(Arc::new(HangingTransport), policy);

        let start = Instant::now();
        let err = client
            .send_json::<Ping>(&HttpRequest::get("https://example.test/ping"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Network(_)), "got: {err:?}");
        // two 10s attempts separated by a 1s backoff
        assert_eq!(start.elapsed(), Duration::from_secs(21));
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn request_debug_hides_credentials() {
        let request = HttpRequest::post_form(
            "https://accounts.spotify.com/api/token",
            &[("grant_type", "refresh_token"), ("refresh_token", "rt_secret")],
        )
        .bearer("at_secret");
        let debug = format!("{request:?}");
        assert!(debug.contains("refresh_token"));
        assert!(!debug.contains("rt_secret"), "got: {debug}");
        assert!(!debug.contains("at_secret"), "got: {debug}");
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 1,
            base_delay: Duration::from_millis(10),
        };
        let client = ResilientHttpClient::from_reqwest(reqwest::Client::new(), policy);
        let err = client
            .send_json::<Ping>(&HttpRequest::get(format!("http://{addr}/ping")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)), "got: {err:?}");
    }
}
