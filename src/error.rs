// Error handling module
// Defines the error taxonomy surfaced to callers of the session client

use reqwest::StatusCode;
use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Generic text shown to the user when the session cannot be recovered
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired, please log in again";

/// Errors that can occur while dispatching API requests or managing the session
#[derive(Error, Debug)]
pub enum ApiError {
    /// Transport could not complete the request (timeout, connect, ...)
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// Non-auth failure reported by the server
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// The server rejected the access credential.
    /// Routed into the refresh coordinator, never returned from a first attempt.
    #[error("Access credential expired")]
    AuthExpired,

    /// Credential renewal failed; the session has been cleared
    #[error("Session expired")]
    SessionExpired,

    /// The session was closed locally while the request was waiting
    #[error("Session terminated")]
    SessionTerminated,

    /// The request was rejected again after a successful renewal
    #[error("Request rejected after credential renewal")]
    ReplayRejected,

    /// Login was refused; carries the server's detail message
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Classify a non-success HTTP response
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        if status == StatusCode::UNAUTHORIZED {
            return ApiError::AuthExpired;
        }

        ApiError::Server {
            status: status.as_u16(),
            message: detail_message(status, body),
        }
    }

    /// Classify a transport failure
    pub fn from_transport(e: &reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        ApiError::Network {
            kind,
            message: e.to_string(),
        }
    }

    /// Whether this failure ended the session (UI should navigate to login)
    pub fn is_session_ending(&self) -> bool {
        matches!(self, ApiError::SessionExpired | ApiError::SessionTerminated)
    }

    /// Text suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            ApiError::SessionExpired | ApiError::SessionTerminated => {
                SESSION_EXPIRED_MESSAGE.to_string()
            }
            ApiError::Server { message, .. } => message.clone(),
            ApiError::LoginFailed(message) => message.clone(),
            ApiError::Network { .. } => {
                "Could not reach the server, check your connection and try again".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Extract the server's human-readable detail from an error body.
///
/// Understands `{"detail": "..."}` and the list form
/// `{"detail": [{"msg": "..."}, ...]}`; anything else falls back to the
/// (truncated) raw body, or the canonical reason for an empty body.
pub fn detail_message(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        match json.get("detail") {
            Some(serde_json::Value::String(detail)) => return detail.clone(),
            Some(serde_json::Value::Array(items)) => {
                let messages: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                    .collect();
                if !messages.is_empty() {
                    return messages.join("; ");
                }
            }
            _ => {}
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string();
    }

    truncate_body(trimmed)
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }

    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}... (truncated, {} total bytes)",
        &body[..end],
        body.len()
    )
}
