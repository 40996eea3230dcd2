// Authentication module
// Credential storage, single-flight renewal and session lifecycle

mod coordinator;
mod credentials;
mod manager;
mod queue;
mod refresh;
mod terminator;
mod types;

pub use coordinator::{RefreshCoordinator, SessionSnapshot};
pub use credentials::{
    CredentialBackend, CredentialStore, MemoryBackend, SqliteBackend, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};
pub use manager::SessionManager;
pub use refresh::{HttpTokenEndpoint, TokenEndpoint};
pub use terminator::SessionTerminator;
pub use types::{
    CoordinatorState, CredentialPair, EndReason, Session, SessionEvent, SessionStatus,
    TokenResponse,
};
