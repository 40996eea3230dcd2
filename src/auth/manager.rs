use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::coordinator::RefreshCoordinator;
use super::credentials::{CredentialStore, SqliteBackend};
use super::refresh::{HttpTokenEndpoint, TokenEndpoint};
use super::terminator::SessionTerminator;
use super::types::{Session, SessionEvent, SessionStatus};
use crate::config::Config;
use crate::error::ApiError;
use crate::http_client::{ApiClient, HttpTransport, Transport};

/// Session manager
/// Wires the store, coordinator and dispatcher together and owns the
/// explicit login/logout flows
pub struct SessionManager {
    store: Arc<CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    terminator: Arc<SessionTerminator>,
    coordinator: RefreshCoordinator,
    client: ApiClient,
}

impl SessionManager {
    /// Build the production stack: SQLite-backed store and reqwest transport
    pub fn from_config(config: &Config) -> Result<Self> {
        tracing::info!("Loading session from SQLite: {}", config.db_file.display());
        let backend = SqliteBackend::open(&config.db_file)?;
        let store = Arc::new(CredentialStore::open(Box::new(backend))?);

        let http = HttpTransport::build_client(
            config.http_max_connections,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?;
        let transport = Arc::new(HttpTransport::new(http.clone(), &config.base_url));
        let endpoint = Arc::new(HttpTokenEndpoint::new(
            http,
            &config.base_url,
            &config.token_path,
        ));

        Ok(Self::new(store, transport, endpoint))
    }

    pub fn new(
        store: Arc<CredentialStore>,
        transport: Arc<dyn Transport>,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        let terminator = Arc::new(SessionTerminator::new(store.clone()));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            endpoint.clone(),
            transport.clone(),
            terminator.clone(),
        );
        let client = ApiClient::new(transport, coordinator.clone());

        Self {
            store,
            endpoint,
            terminator,
            coordinator,
            client,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let pair = self.endpoint.login(username, password).await?;
        self.coordinator.install(pair);
        self.terminator.publish(SessionEvent::LoggedIn);
        Ok(())
    }

    pub fn logout(&self) {
        tracing::info!("Logging out");
        self.coordinator.end_session();
    }

    pub fn session(&self) -> Session {
        match self.store.read() {
            Some(pair) => Session::Authenticated(pair),
            None => Session::Unauthenticated,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            authenticated: self.store.read().is_some(),
            coordinator: self.coordinator.state(),
            renewals: self.coordinator.renewals(),
            last_renewed_at: self.coordinator.last_renewed_at(),
        }
    }

    /// The request dispatcher bound to this session
    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.terminator.subscribe()
    }
}
