//! HTTP API error mapping
//!
//! Every failed request answers with
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] spotify_session::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use spotify_auth::Error as Auth;
        use spotify_session::Error as Session;

        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Session(e) => match e {
                Session::Auth(Auth::Network(_) | Auth::Server { .. }) => StatusCode::BAD_GATEWAY,
                Session::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
                Session::MissingAuthorizationCode | Session::MissingRefreshToken => {
                    StatusCode::BAD_GATEWAY
                }
                Session::AccessDenied(_) => StatusCode::FORBIDDEN,
                Session::RedirectTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                Session::Cancelled => StatusCode::CONFLICT,
                Session::NoMatchingSession(_) | Session::NotFound(_) => StatusCode::NOT_FOUND,
                Session::InvalidScopes(_) => StatusCode::BAD_REQUEST,
                Session::BrowserLaunch(_)
                | Session::RedirectClosed(_)
                | Session::Storage(_)
                | Session::SessionParse(_)
                | Session::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Value of the `type` field in the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Session(e) => e.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        if status.is_server_error() {
            warn!(error = %self, kind = self.kind(), request_id = %request_id, "request failed");
        }
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
    }
}
