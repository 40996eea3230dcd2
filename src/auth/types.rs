// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Access and renewal credential, both opaque bearer secrets
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Keep secrets out of debug logs
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &token_prefix(&self.access_token))
            .field("refresh_token", &token_prefix(&self.refresh_token))
            .finish()
    }
}

/// Token endpoint response (login and renewal share the shape)
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken", alias = "renewalToken")]
    pub refresh_token: String,
    #[serde(alias = "tokenType", default)]
    pub token_type: Option<String>,
}

impl From<TokenResponse> for CredentialPair {
    fn from(response: TokenResponse) -> Self {
        CredentialPair::new(response.access_token, response.refresh_token)
    }
}

/// Derived session state
#[derive(Debug, Clone, PartialEq)]
pub enum Session {
    Authenticated(CredentialPair),
    Unauthenticated,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Session::Authenticated(_))
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Renewal failed
    Expired,
    /// Explicit logout
    LoggedOut,
}

/// Notifications published to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn,
    Renewed { attempt: u64 },
    Ended { reason: EndReason },
}

/// Snapshot of the refresh coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Renewing { attempt: u64, queued: usize },
}

/// Session snapshot for display
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub coordinator: CoordinatorState,
    pub renewals: u64,
    pub last_renewed_at: Option<DateTime<Utc>>,
}

/// Short, log-safe prefix of a secret
pub(crate) fn token_prefix(token: &str) -> String {
    if token.is_empty() {
        return "<empty>".to_string();
    }
    let prefix: String = token.chars().take(6).collect();
    format!("{}...", prefix)
}
