//! Loopback HTTP surface
//!
//! - `GET  /health`              liveness plus session and flow counts
//! - `GET  /metrics`             Prometheus exposition
//! - `GET  /callback`            OAuth redirect target (path follows `callback_uri`)
//! - `GET  /sessions?scopes=a,b` stored sessions, tokens omitted
//! - `POST /token`               access token for a scope set, signing in if needed
//! - `DELETE /sessions/{id}`     sign a session out
//! - `GET  /flows`               interactive flows in progress
//! - `POST /flows/cancel`        cancel every flow in progress

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use spotify_session::{Account, AuthProvider, ScopeSet, Session};
use tracing::{debug, info};
use url::Url;

use crate::callback::LoopbackRedirectWaiter;
use crate::error::ApiError;
use crate::metrics;

const SUCCESS_HTML: &str = "<html><body><h1>Signed in to Spotify</h1><p>You can close this window.</p></body></html>";
const NO_FLOW_HTML: &str = "<html><body><h1>No sign-in in progress</h1><p>Start again from your application.</p></body></html>";

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<AuthProvider>,
    pub redirect: LoopbackRedirectWaiter,
    /// Used when a token request names no scopes
    pub default_scopes: ScopeSet,
    pub callback_uri: Url,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the router. The callback route is mounted at the path of `callback_uri`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    let callback_path = state.callback_uri.path().to_string();
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(&callback_path, get(callback_handler))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(remove_session))
        .route("/token", post(token_handler))
        .route("/flows", get(list_flows))
        .route("/flows/cancel", post(cancel_flows))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: impl Serialize) -> Response {
    match serde_json::to_string(&body) {
        Ok(body) => (status, [(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => ApiError::Session(spotify_session::Error::Internal(e.to_string())).into_response(),
    }
}

/// Record the outcome of `route` and turn errors into JSON responses.
fn finish(route: &'static str, result: Result<Response, ApiError>) -> Response {
    let response = result.unwrap_or_else(IntoResponse::into_response);
    metrics::record_request(route, response.status().as_u16());
    response
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "healthy",
        "provider": AuthProvider::ID,
        "sessions": state.provider.get_sessions(None).await.len(),
        "pending_flows": state.provider.pending_flows().len(),
        "refresh_timers": state.provider.scheduler().armed_count(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });
    json_response(StatusCode::OK, body)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

async fn callback_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Response {
    let mut callback = state.callback_uri.clone();
    callback.set_query(query.as_deref());

    let delivered = state.redirect.deliver(callback);
    let status = if delivered {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    metrics::record_request("callback", status.as_u16());
    let page = if delivered { SUCCESS_HTML } else { NO_FLOW_HTML };
    (status, [(CONTENT_TYPE, "text/html; charset=utf-8")], page).into_response()
}

/// A session as shown over the API. Tokens are never listed.
#[derive(Debug, Serialize)]
struct SessionView<'a> {
    id: &'a str,
    account: &'a Account,
    scopes: &'a [String],
    expires_in: u64,
}

impl<'a> From<&'a Session> for SessionView<'a> {
    fn from(session: &'a Session) -> Self {
        Self {
            id: &session.id,
            account: &session.account,
            scopes: &session.scopes,
            expires_in: session.expires_in,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    scopes: Option<String>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    finish("sessions", sessions_reply(&state, query).await)
}

async fn sessions_reply(state: &AppState, query: SessionsQuery) -> Result<Response, ApiError> {
    let filter = query.scopes.as_deref().map(ScopeSet::parse).transpose()?;
    let sessions = state.provider.get_sessions(filter.as_ref()).await;
    let views: Vec<SessionView<'_>> = sessions.iter().map(SessionView::from).collect();
    Ok(json_response(StatusCode::OK, views))
}

async fn remove_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    finish("remove_session", remove_reply(&state, &id).await)
}

async fn remove_reply(state: &AppState, id: &str) -> Result<Response, ApiError> {
    let exists = state
        .provider
        .get_sessions(None)
        .await
        .iter()
        .any(|s| s.id == id);
    if !exists {
        return Err(ApiError::NotFound(format!("session {id} not found")));
    }
    state.provider.remove_session(id).await?;
    info!(session_id = %id, "session signed out over API");
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TokenRequest {
    scopes: Option<Vec<String>>,
    create_if_none: Option<bool>,
}

#[derive(Debug, Serialize)]
struct TokenReply<'a> {
    session_id: &'a str,
    access_token: &'a str,
    expires_in: u64,
    account: &'a Account,
    scopes: &'a [String],
}

async fn token_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let started = Instant::now();
    let result = token_reply(&state, &body).await;
    metrics::record_token_duration(started.elapsed().as_secs_f64());
    finish("token", result)
}

async fn token_reply(state: &AppState, body: &[u8]) -> Result<Response, ApiError> {
    let request: TokenRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TokenRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::BadRequest(format!("invalid token request: {e}")))?
    };
    let scopes = match request.scopes {
        Some(scopes) => ScopeSet::new(&scopes)?,
        None => state.default_scopes.clone(),
    };
    let create = request.create_if_none.unwrap_or(true);
    debug!(scopes = %scopes, create, "token requested");

    let session = state
        .provider
        .get_session(&scopes, create)
        .await?
        .ok_or_else(|| spotify_session::Error::NoMatchingSession(scopes.key()))?;
    Ok(json_response(
        StatusCode::OK,
        TokenReply {
            session_id: &session.id,
            access_token: &session.access_token,
            expires_in: session.expires_in,
            account: &session.account,
            scopes: &session.scopes,
        },
    ))
}

async fn list_flows(State(state): State<AppState>) -> Response {
    let flows: Vec<serde_json::Value> = state
        .provider
        .pending_flows()
        .into_iter()
        .map(|flow| serde_json::json!({ "scopes": flow.scopes, "state": flow.state.as_str() }))
        .collect();
    finish("flows", Ok(json_response(StatusCode::OK, flows)))
}

async fn cancel_flows(State(state): State<AppState>) -> Response {
    let cancelled = state.provider.cancel_pending_flows();
    info!(cancelled, "pending flows cancelled over API");
    finish(
        "cancel_flows",
        Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "cancelled": cancelled }),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Body;
    use axum::extract::Form;
    use axum::http::{HeaderMap, Request};
    use spotify_auth::{OAuthConfig, ReqwestTransport};
    use spotify_session::{
        BrowserOpener, Collaborators, MemorySecretStorage, ProviderConfig, RedirectWaiter,
    };
    use tower::ServiceExt;

    /// Token and profile endpoints standing in for Spotify.
    #[derive(Clone, Default)]
    struct MockSpotify {
        grants: Arc<Mutex<Vec<String>>>,
    }

    async fn token_endpoint(
        State(mock): State<MockSpotify>,
        Form(form): Form<HashMap<String, String>>,
    ) -> impl IntoResponse {
        let grant = form.get("grant_type").cloned().unwrap_or_default();
        mock.grants.lock().unwrap().push(grant.clone());
        match grant.as_str() {
            "authorization_code" if form.get("code").map(String::as_str) == Some("abc123") => (
                StatusCode::OK,
                r#"{"access_token":"AT1","refresh_token":"RT1","expires_in":3600}"#,
            ),
            _ => (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#),
        }
    }

    async fn me_endpoint(headers: HeaderMap) -> impl IntoResponse {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer AT1") => (StatusCode::OK, r#"{"id":"u1","display_name":"Ada"}"#),
            _ => (StatusCode::UNAUTHORIZED, r#"{"error":"no token"}"#),
        }
    }

    async fn start_mock_spotify(mock: MockSpotify) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/api/token", post(token_endpoint))
            .route("/v1/me", get(me_endpoint))
            .with_state(mock);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Plays the user: approves consent and sends the relay's redirect
    /// straight back to the waiter.
    struct ApprovingBrowser {
        redirect: LoopbackRedirectWaiter,
        opened: AtomicUsize,
    }

    impl BrowserOpener for ApprovingBrowser {
        fn open(&self, url: &Url) -> spotify_session::Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let state = url
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.into_owned())
                .unwrap();
            let mut callback = Url::parse(&state).unwrap();
            callback.query_pairs_mut().append_pair("code", "abc123");
            assert!(self.redirect.deliver(callback));
            Ok(())
        }
    }

    struct Harness {
        app: Router,
        browser: Arc<ApprovingBrowser>,
        mock: MockSpotify,
        redirect: LoopbackRedirectWaiter,
    }

    async fn harness() -> Harness {
        let mock = MockSpotify::default();
        let base = start_mock_spotify(mock.clone()).await;
        let redirect = LoopbackRedirectWaiter::new();
        let browser = Arc::new(ApprovingBrowser {
            redirect: redirect.clone(),
            opened: AtomicUsize::new(0),
        });

        let config = ProviderConfig {
            oauth: OAuthConfig {
                token_endpoint: format!("{base}/api/token"),
                user_info_endpoint: format!("{base}/v1/me"),
                ..OAuthConfig::default()
            },
            ..ProviderConfig::default()
        };
        let provider = AuthProvider::initialize(
            config,
            Collaborators {
                storage: Arc::new(MemorySecretStorage::new()),
                redirect: Arc::new(redirect.clone()),
                browser: browser.clone(),
                transport: Arc::new(ReqwestTransport::default()),
            },
        )
        .await
        .unwrap();

        let (_recorder, prometheus) = crate::metrics::isolated_recorder();
        let state = AppState {
            provider: Arc::new(provider),
            redirect: redirect.clone(),
            default_scopes: ScopeSet::new(OAuthConfig::default_scopes()).unwrap(),
            callback_uri: Url::parse(spotify_auth::DEFAULT_CALLBACK_URI).unwrap(),
            prometheus,
            started_at: Instant::now(),
        };
        Harness {
            app: build_router(state, 16),
            browser,
            mock,
            redirect,
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn json(body: &str) -> serde_json::Value {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let h = harness().await;
        let (status, body) = send(&h.app, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["provider"], "spotify");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["pending_flows"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_is_prometheus_text() {
        let h = harness().await;
        let response = h
            .app
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn token_signs_in_once_then_reuses_the_session() {
        let h = harness().await;

        let (status, body) = send(&h.app, "POST", "/token", "").await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let first = json(&body);
        assert_eq!(first["access_token"], "AT1");
        assert_eq!(first["account"]["label"], "Ada");
        assert_eq!(first["expires_in"], 3600);

        let (status, body) = send(
            &h.app,
            "POST",
            "/token",
            r#"{"scopes":["user-read-email"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["session_id"], first["session_id"]);

        assert_eq!(h.browser.opened.load(Ordering::SeqCst), 1);
        assert_eq!(*h.mock.grants.lock().unwrap(), ["authorization_code"]);
    }

    #[tokio::test]
    async fn token_without_create_is_not_found() {
        let h = harness().await;
        let (status, body) = send(&h.app, "POST", "/token", r#"{"create_if_none":false}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["error"]["type"], "not_found");
        assert_eq!(h.browser.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_token_requests_are_rejected() {
        let h = harness().await;

        let (status, body) = send(&h.app, "POST", "/token", r#"{"scopes":[]}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"]["type"], "invalid_scopes");

        let (status, body) = send(&h.app, "POST", "/token", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn sessions_listing_hides_tokens_and_filters() {
        let h = harness().await;
        send(&h.app, "POST", "/token", "").await;

        let (status, body) = send(&h.app, "GET", "/sessions", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.contains("AT1") && !body.contains("RT1"), "{body}");
        let sessions = json(&body);
        assert_eq!(sessions.as_array().unwrap().len(), 1);
        assert_eq!(sessions[0]["account"]["id"], "u1");

        let (_, body) = send(
            &h.app,
            "GET",
            "/sessions?scopes=user-read-email,user-read-private",
            "",
        )
        .await;
        assert_eq!(json(&body).as_array().unwrap().len(), 1);

        let (_, body) = send(&h.app, "GET", "/sessions?scopes=playlist-modify-public", "").await;
        assert!(json(&body).as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_session_then_unknown_is_404() {
        let h = harness().await;
        let (_, body) = send(&h.app, "POST", "/token", "").await;
        let id = json(&body)["session_id"].as_str().unwrap().to_string();

        let (status, _) = send(&h.app, "DELETE", &format!("/sessions/{id}"), "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&h.app, "DELETE", &format!("/sessions/{id}"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["error"]["type"], "not_found");

        let (_, body) = send(&h.app, "GET", "/health", "").await;
        assert_eq!(json(&body)["sessions"], 0);
        assert_eq!(json(&body)["refresh_timers"], 0);
    }

    #[tokio::test]
    async fn callback_without_a_flow_is_404() {
        let h = harness().await;
        let (status, body) = send(&h.app, "GET", "/callback?nonce=abc&code=x", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("No sign-in in progress"));
    }

    #[tokio::test]
    async fn callback_wakes_the_waiting_flow() {
        let h = harness().await;
        let pending = h.redirect.wait_for_callback("n1");

        let (status, body) = send(&h.app, "GET", "/callback?nonce=n1&code=xyz", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Signed in"));

        let url = pending.await.unwrap();
        assert_eq!(url.path(), "/callback");
        assert_eq!(spotify_session::extract_code(&url).unwrap(), "xyz");
    }

    #[tokio::test]
    async fn flows_listing_and_cancel_when_idle() {
        let h = harness().await;
        let (status, body) = send(&h.app, "GET", "/flows", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json(&body).as_array().unwrap().is_empty());

        let (status, body) = send(&h.app, "POST", "/flows/cancel", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["cancelled"], 0);
    }
}
