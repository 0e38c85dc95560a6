//! HTTP API handlers.
//!
//! Defines the Actix routes for playback and session inspection.

pub mod health;
pub mod play;
pub mod sessions;

use actix_web::HttpResponse;

pub use health::health_check;
pub use play::play_socket;
pub use sessions::{sessions_close, sessions_list};

/// Response header carrying the id of the session a `/play` upgrade opened.
pub(crate) const SESSION_ID_HEADER: &str = "x-session-id";

/// Handler-level failures mapped to HTTP responses.
#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub(crate) fn into_response(self) -> HttpResponse {
        match self {
            ApiError::BadRequest(msg) => HttpResponse::BadRequest().body(msg),
            ApiError::NotFound(msg) => HttpResponse::NotFound().body(msg),
            ApiError::Unavailable(msg) => HttpResponse::ServiceUnavailable().body(msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                HttpResponse::InternalServerError().body(msg)
            }
        }
    }
}
