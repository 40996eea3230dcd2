// Single-flight credential renewal and request replay

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use super::credentials::CredentialStore;
use super::queue::{Outcome, PendingRequest, ReplayQueue};
use super::refresh::TokenEndpoint;
use super::terminator::SessionTerminator;
use super::types::{CoordinatorState, CredentialPair, EndReason, SessionEvent};
use crate::error::ApiError;
use crate::http_client::{ApiRequest, ApiResponse, Transport};

enum State {
    Idle,
    Renewing(RenewalAttempt),
}

/// The one live renewal and the requests waiting on it
struct RenewalAttempt {
    id: u64,
    queue: ReplayQueue,
}

/// How a request reporting an expired credential is handled
enum Admission {
    /// Parked in the live attempt's queue
    Waiting(oneshot::Receiver<Outcome>),
    /// A renewal already completed after the request was sent
    Replay(ApiRequest, String),
    /// There is no credential to renew
    NoSession,
    /// The request belongs to a session that was logged out or replaced
    Superseded,
}

/// The credential a request is sent with and the session it belongs to.
///
/// Taken by the dispatcher right before sending; a rejection is only ever
/// resolved within the session the request was sent under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub access_token: Option<String>,
    pub epoch: u64,
}

struct Shared {
    /// Never held across an await point
    state: Mutex<State>,

    next_attempt: AtomicU64,

    /// Bumped by login and logout; replays started under an older epoch fail fast
    epoch: AtomicU64,

    renewals: AtomicU64,
    last_renewed_at: Mutex<Option<DateTime<Utc>>>,

    store: Arc<CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    transport: Arc<dyn Transport>,
    terminator: Arc<SessionTerminator>,
}

/// Owns the `Idle | Renewing` state machine.
///
/// The first caller to report an expired credential while idle starts exactly
/// one renewal; everyone else reporting while it runs joins its queue. When the
/// renewal settles the queue is replayed in enqueue order with the new
/// credential, or failed as a whole and the session terminated.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        transport: Arc<dyn Transport>,
        terminator: Arc<SessionTerminator>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Idle),
                next_attempt: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                renewals: AtomicU64::new(0),
                last_renewed_at: Mutex::new(None),
                store,
                endpoint,
                transport,
                terminator,
            }),
        }
    }

    /// Current credential and session epoch, read together
    pub fn snapshot(&self) -> SessionSnapshot {
        let _state = self.shared.lock_state();
        SessionSnapshot {
            access_token: self.shared.store.access_token(),
            epoch: self.shared.epoch.load(Ordering::SeqCst),
        }
    }

    /// Resolve a request whose credential was rejected.
    ///
    /// `sent_with` is the snapshot the request was sent under. Its token tells
    /// a fresh expiry apart from a request that raced a renewal that already
    /// finished; its epoch keeps the request out of any later session.
    pub async fn handle_expired(
        &self,
        request: ApiRequest,
        sent_with: SessionSnapshot,
    ) -> Result<ApiResponse, ApiError> {
        match self.admit(request, sent_with) {
            Admission::Waiting(receiver) => receiver.await.unwrap_or_else(|_| {
                Err(ApiError::Internal(anyhow::anyhow!(
                    "Renewal attempt dropped a queued request"
                )))
            }),
            Admission::Replay(request, access_token) => {
                tracing::debug!(
                    request_id = %request.id(),
                    "Credential renewed since request was sent, replaying"
                );
                self.shared.replay(&request, &access_token).await
            }
            Admission::NoSession => {
                tracing::debug!("Credential rejected with no session to renew");
                Err(ApiError::SessionExpired)
            }
            Admission::Superseded => Err(ApiError::SessionTerminated),
        }
    }

    fn admit(&self, request: ApiRequest, sent_with: SessionSnapshot) -> Admission {
        let mut state = self.shared.lock_state();

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        if sent_with.epoch != epoch {
            tracing::debug!(
                request_id = %request.id(),
                sent_epoch = sent_with.epoch,
                epoch = epoch,
                "Credential rejected for a session that has since ended"
            );
            return Admission::Superseded;
        }

        if let State::Renewing(attempt) = &mut *state {
            let request_id = request.id();
            let (pending, receiver) = PendingRequest::new(request);
            let position = attempt.queue.enqueue(pending);
            tracing::debug!(
                attempt = attempt.id,
                request_id = %request_id,
                position = position,
                "Joined in-flight renewal"
            );
            return Admission::Waiting(receiver);
        }

        let Some(current) = self.shared.store.read() else {
            return Admission::NoSession;
        };

        if sent_with.access_token.as_deref() != Some(current.access_token.as_str()) {
            return Admission::Replay(request, current.access_token);
        }

        let id = self.shared.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let (pending, receiver) = PendingRequest::new(request);
        let mut queue = ReplayQueue::new();
        queue.enqueue(pending);
        *state = State::Renewing(RenewalAttempt { id, queue });

        tracing::info!(attempt = id, "Access credential expired, starting renewal");
        tokio::spawn(self.shared.clone().run_attempt(id, current.refresh_token));

        Admission::Waiting(receiver)
    }

    /// Install credentials from a successful login.
    ///
    /// A renewal still in flight belongs to the previous session: it is
    /// detached, its waiters fail with `SessionTerminated` and its result is
    /// discarded.
    pub(crate) fn install(&self, pair: CredentialPair) {
        let detached = {
            let mut state = self.shared.lock_state();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            let detached = detach(&mut state);
            self.shared.store.replace(Some(pair));
            detached
        };
        self.shared.store.flush();

        if let Some(attempt) = detached {
            tracing::warn!(
                attempt = attempt.id,
                queued = attempt.queue.len(),
                "Login replaced a session with a renewal in flight"
            );
            attempt.queue.fail_all(|| ApiError::SessionTerminated);
        }
    }

    /// Explicit logout: clear credentials now, fail waiting requests fast.
    ///
    /// The in-flight renewal call, if any, is left to finish; its result is
    /// never written.
    pub(crate) fn end_session(&self) {
        let detached = {
            let mut state = self.shared.lock_state();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            let detached = detach(&mut state);
            self.shared.terminator.terminate(EndReason::LoggedOut);
            detached
        };
        self.shared.store.flush();

        if let Some(attempt) = detached {
            tracing::info!(
                attempt = attempt.id,
                queued = attempt.queue.len(),
                "Logout detached in-flight renewal"
            );
            attempt.queue.fail_all(|| ApiError::SessionTerminated);
        }
    }

    pub fn state(&self) -> CoordinatorState {
        match &*self.shared.lock_state() {
            State::Idle => CoordinatorState::Idle,
            State::Renewing(attempt) => CoordinatorState::Renewing {
                attempt: attempt.id,
                queued: attempt.queue.len(),
            },
        }
    }

    /// Number of renewal attempts started so far
    pub fn attempts_started(&self) -> u64 {
        self.shared.next_attempt.load(Ordering::SeqCst)
    }

    /// Number of renewals that succeeded and were installed
    pub fn renewals(&self) -> u64 {
        self.shared.renewals.load(Ordering::SeqCst)
    }

    pub fn last_renewed_at(&self) -> Option<DateTime<Utc>> {
        *self
            .shared
            .last_renewed_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_attempt(self: Arc<Self>, id: u64, refresh_token: String) {
        // Run the call in its own task so a panicking endpoint still settles the attempt
        let endpoint = self.endpoint.clone();
        let renewal = tokio::spawn(async move {
            if refresh_token.is_empty() {
                return Err(ApiError::Internal(anyhow::anyhow!(
                    "No renewal credential stored"
                )));
            }
            endpoint.renew(&refresh_token).await
        });

        let outcome = renewal.await.unwrap_or_else(|e| {
            Err(ApiError::Internal(anyhow::anyhow!(
                "Renewal task failed: {}",
                e
            )))
        });

        match outcome {
            Ok(pair) => self.settle_success(id, pair).await,
            Err(e) => self.settle_failure(id, e),
        }
    }

    async fn settle_success(&self, id: u64, pair: CredentialPair) {
        let (attempt, epoch) = {
            let mut state = self.lock_state();
            let Some(attempt) = take_attempt(&mut state, id) else {
                tracing::debug!(attempt = id, "Attempt detached before renewal settled, discarding credential");
                return;
            };
            self.store.replace(Some(pair.clone()));
            (attempt, self.epoch.load(Ordering::SeqCst))
        };
        self.store.flush();

        self.renewals.fetch_add(1, Ordering::SeqCst);
        *self
            .last_renewed_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.terminator.publish(SessionEvent::Renewed { attempt: id });

        tracing::info!(
            attempt = id,
            queued = attempt.queue.len(),
            "Renewal succeeded, replaying queued requests"
        );

        for pending in attempt.queue.drain_in_order() {
            let outcome = if self.epoch.load(Ordering::SeqCst) != epoch {
                Err(ApiError::SessionTerminated)
            } else {
                self.replay(pending.request(), &pair.access_token).await
            };
            pending.complete(outcome);
        }
    }

    fn settle_failure(&self, id: u64, error: ApiError) {
        let attempt = {
            let mut state = self.lock_state();
            let Some(attempt) = take_attempt(&mut state, id) else {
                tracing::debug!(attempt = id, error = %error, "Detached renewal failed");
                return;
            };
            self.terminator.terminate(EndReason::Expired);
            attempt
        };
        self.store.flush();

        tracing::warn!(
            attempt = id,
            error = %error,
            queued = attempt.queue.len(),
            "Renewal failed, session ended"
        );
        attempt.queue.fail_all(|| ApiError::SessionExpired);
    }

    /// Re-issue a request once. A second rejection is terminal.
    async fn replay(&self, request: &ApiRequest, access_token: &str) -> Outcome {
        match self.transport.execute(request, Some(access_token)).await {
            Err(ApiError::AuthExpired) => {
                tracing::warn!(
                    request_id = %request.id(),
                    path = %request.path(),
                    "Request rejected again after renewal"
                );
                Err(ApiError::ReplayRejected)
            }
            other => other,
        }
    }
}

fn detach(state: &mut State) -> Option<RenewalAttempt> {
    match std::mem::replace(state, State::Idle) {
        State::Renewing(attempt) => Some(attempt),
        State::Idle => None,
    }
}

/// Take the live attempt only if it is still the one with `id`
fn take_attempt(state: &mut State, id: u64) -> Option<RenewalAttempt> {
    if matches!(state, State::Renewing(attempt) if attempt.id == id) {
        detach(state)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::MemoryBackend;
    use crate::http_client::ApiClient;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{broadcast, Semaphore};

    /// Token endpoint whose renewals wait for the test to open a gate
    struct GatedEndpoint {
        calls: AtomicUsize,
        finished: AtomicUsize,
        gate: Semaphore,
        results: Mutex<Vec<Result<CredentialPair, ApiError>>>,
    }

    impl GatedEndpoint {
        fn new(results: Vec<Result<CredentialPair, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                results: Mutex::new(results),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl TokenEndpoint for GatedEndpoint {
        async fn login(&self, _username: &str, _password: &str) -> Result<CredentialPair, ApiError> {
            Ok(CredentialPair::new("A1", "R1"))
        }

        async fn renew(&self, _refresh_token: &str) -> Result<CredentialPair, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.finished.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().remove(0)
        }
    }

    /// Transport that accepts exactly one access token and records every call
    struct FakeTransport {
        valid: Mutex<Option<String>>,
        log: Mutex<Vec<(String, Option<String>)>>,
    }

    impl FakeTransport {
        fn accepting(token: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                valid: Mutex::new(token.map(str::to_string)),
                log: Mutex::new(Vec::new()),
            })
        }

        fn accept(&self, token: Option<&str>) {
            *self.valid.lock().unwrap() = token.map(str::to_string);
        }

        fn calls_with(&self, token: &str) -> Vec<String> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, t)| t.as_deref() == Some(token))
                .map(|(path, _)| path.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn execute(
            &self,
            request: &ApiRequest,
            access_token: Option<&str>,
        ) -> Result<ApiResponse, ApiError> {
            self.log
                .lock()
                .unwrap()
                .push((request.path().to_string(), access_token.map(str::to_string)));

            let valid = self.valid.lock().unwrap().clone();
            if valid.is_some() && valid.as_deref() == access_token {
                Ok(ApiResponse::new(200, request.path().to_string()))
            } else {
                Err(ApiError::AuthExpired)
            }
        }
    }

    struct Harness {
        store: Arc<CredentialStore>,
        endpoint: Arc<GatedEndpoint>,
        transport: Arc<FakeTransport>,
        coordinator: RefreshCoordinator,
        client: ApiClient,
        events: broadcast::Receiver<SessionEvent>,
    }

    fn harness(
        stored: Option<CredentialPair>,
        accepted: Option<&str>,
        results: Vec<Result<CredentialPair, ApiError>>,
    ) -> Harness {
        let backend = match stored {
            Some(pair) => MemoryBackend::with_pair(pair),
            None => MemoryBackend::new(),
        };
        let store = Arc::new(CredentialStore::open(Box::new(backend)).unwrap());
        let endpoint = GatedEndpoint::new(results);
        let transport = FakeTransport::accepting(accepted);
        let terminator = Arc::new(SessionTerminator::new(store.clone()));
        let events = terminator.subscribe();
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            endpoint.clone(),
            transport.clone(),
            terminator,
        );
        let client = ApiClient::new(transport.clone(), coordinator.clone());

        Harness {
            store,
            endpoint,
            transport,
            coordinator,
            client,
            events,
        }
    }

    /// Let spawned tasks run until `queued` requests wait on the live attempt
    async fn wait_for_queue(coordinator: &RefreshCoordinator, queued: usize) {
        for _ in 0..10_000 {
            if let CoordinatorState::Renewing { queued: n, .. } = coordinator.state() {
                if n >= queued {
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {} requests", queued);
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    /// Send `paths` one after another, each waiting until it is queued
    async fn send_queued(
        h: &Harness,
        paths: &[&str],
    ) -> Vec<tokio::task::JoinHandle<Result<ApiResponse, ApiError>>> {
        let mut handles = Vec::new();
        for (i, path) in paths.iter().enumerate() {
            let client = h.client.clone();
            let path = path.to_string();
            handles.push(tokio::spawn(async move { client.get(&path).await }));
            wait_for_queue(&h.coordinator, i + 1).await;
        }
        handles
    }

    #[tokio::test]
    async fn test_three_concurrent_expiries_share_one_renewal() {
        let mut h = harness(
            Some(CredentialPair::new("A1", "R1")),
            Some("A2"),
            vec![Ok(CredentialPair::new("A2", "R2"))],
        );

        let paths = ["/vault/rooms", "/vault/dwellers", "/vault/incidents"];
        let handles = send_queued(&h, &paths).await;

        assert_eq!(h.endpoint.calls(), 1);
        h.endpoint.release();

        for (handle, path) in handles.into_iter().zip(paths) {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.text(), path);
        }

        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(h.transport.calls_with("A2"), paths);
        assert_eq!(h.store.read(), Some(CredentialPair::new("A2", "R2")));
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert_eq!(h.coordinator.renewals(), 1);
        assert!(h.coordinator.last_renewed_at().is_some());
        assert_eq!(h.events.recv().await.unwrap(), SessionEvent::Renewed { attempt: 1 });
    }

    #[tokio::test]
    async fn test_renewal_failure_expires_every_waiter_and_terminates_once() {
        let mut h = harness(
            Some(CredentialPair::new("A1", "R1")),
            Some("A2"),
            vec![Err(ApiError::Server {
                status: 401,
                message: "Refresh token revoked".to_string(),
            })],
        );

        let handles = send_queued(&h, &["/a", "/b", "/c"]).await;
        h.endpoint.release();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, ApiError::SessionExpired));
        }

        assert_eq!(h.endpoint.calls(), 1);
        assert!(h.store.read().is_none());
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert_eq!(
            h.events.recv().await.unwrap(),
            SessionEvent::Ended {
                reason: EndReason::Expired
            }
        );
        assert!(matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_later_expiry_starts_a_new_attempt() {
        let mut h = harness(
            Some(CredentialPair::new("A1", "R1")),
            Some("A2"),
            vec![
                Ok(CredentialPair::new("A2", "R2")),
                Ok(CredentialPair::new("A3", "R3")),
            ],
        );

        let handles = send_queued(&h, &["/first"]).await;
        h.endpoint.release();
        handles.into_iter().next().unwrap().await.unwrap().unwrap();

        // Server now only accepts A3; A2 is stale
        h.transport.accept(Some("A3"));
        let handles = send_queued(&h, &["/second"]).await;
        h.endpoint.release();
        let response = handles.into_iter().next().unwrap().await.unwrap().unwrap();
        assert_eq!(response.text(), "/second");

        assert_eq!(h.endpoint.calls(), 2);
        assert_eq!(h.coordinator.attempts_started(), 2);
        assert_eq!(h.store.read(), Some(CredentialPair::new("A3", "R3")));
        assert_eq!(h.events.recv().await.unwrap(), SessionEvent::Renewed { attempt: 1 });
        assert_eq!(h.events.recv().await.unwrap(), SessionEvent::Renewed { attempt: 2 });
    }

    #[tokio::test]
    async fn test_second_rejection_on_replay_is_terminal() {
        let h = harness(
            Some(CredentialPair::new("A1", "R1")),
            None,
            vec![Ok(CredentialPair::new("A2", "R2"))],
        );

        let handles = send_queued(&h, &["/vault"]).await;
        h.endpoint.release();

        let err = handles.into_iter().next().unwrap().await.unwrap().unwrap_err();
        assert!(matches!(err, ApiError::ReplayRejected));
        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        // Renewal itself succeeded, so the session stays
        assert_eq!(h.store.read(), Some(CredentialPair::new("A2", "R2")));
    }

    #[tokio::test]
    async fn test_stale_rejection_replays_without_renewal() {
        let h = harness(Some(CredentialPair::new("A2", "R2")), Some("A2"), vec![]);

        let response = h
            .coordinator
            .handle_expired(
                ApiRequest::get("/late"),
                SessionSnapshot {
                    access_token: Some("A1".to_string()),
                    epoch: 0,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.text(), "/late");
        assert_eq!(h.endpoint.calls(), 0);
        assert_eq!(h.coordinator.attempts_started(), 0);
    }

    #[tokio::test]
    async fn test_rejection_without_session_does_not_renew() {
        let mut h = harness(None, Some("A1"), vec![]);

        let err = h.client.get("/vault").await.unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert_eq!(h.endpoint.calls(), 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_renewal_credential_fails_attempt() {
        let mut h = harness(Some(CredentialPair::new("A1", "")), Some("A2"), vec![]);

        let err = h.client.get("/vault").await.unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert_eq!(h.endpoint.calls(), 0);
        assert!(h.store.read().is_none());
        assert_eq!(
            h.events.recv().await.unwrap(),
            SessionEvent::Ended {
                reason: EndReason::Expired
            }
        );
    }

    #[tokio::test]
    async fn test_logout_during_renewal_fails_fast_and_discards_result() {
        let mut h = harness(
            Some(CredentialPair::new("A1", "R1")),
            Some("A2"),
            vec![Ok(CredentialPair::new("A2", "R2"))],
        );

        let handles = send_queued(&h, &["/a", "/b"]).await;

        h.coordinator.end_session();
        assert!(h.store.read().is_none());
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, ApiError::SessionTerminated));
        }

        // The renewal call was not cancelled; its result must not revive the session
        h.endpoint.release();
        let endpoint = h.endpoint.clone();
        wait_until(move || endpoint.finished.load(Ordering::SeqCst) == 1).await;
        tokio::task::yield_now().await;

        assert!(h.store.read().is_none());
        assert_eq!(h.coordinator.renewals(), 0);
        assert_eq!(
            h.events.recv().await.unwrap(),
            SessionEvent::Ended {
                reason: EndReason::LoggedOut
            }
        );
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_disturb_the_attempt() {
        let h = harness(
            Some(CredentialPair::new("A1", "R1")),
            Some("A2"),
            vec![Ok(CredentialPair::new("A2", "R2"))],
        );

        let mut handles = send_queued(&h, &["/abandoned", "/kept"]).await;
        let kept = handles.pop().unwrap();
        let abandoned = handles.pop().unwrap();
        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());

        h.endpoint.release();
        let response = kept.await.unwrap().unwrap();
        assert_eq!(response.text(), "/kept");
        assert_eq!(h.transport.calls_with("A2"), vec!["/abandoned", "/kept"]);
    }

    #[tokio::test]
    async fn test_install_detaches_in_flight_renewal() {
        let h = harness(
            Some(CredentialPair::new("A1", "R1")),
            Some("B1"),
            vec![Ok(CredentialPair::new("A2", "R2"))],
        );

        let handles = send_queued(&h, &["/a"]).await;
        h.coordinator.install(CredentialPair::new("B1", "S1"));

        let err = handles.into_iter().next().unwrap().await.unwrap().unwrap_err();
        assert!(matches!(err, ApiError::SessionTerminated));

        h.endpoint.release();
        let endpoint = h.endpoint.clone();
        wait_until(move || endpoint.finished.load(Ordering::SeqCst) == 1).await;
        tokio::task::yield_now().await;

        assert_eq!(h.store.read(), Some(CredentialPair::new("B1", "S1")));
    }

    #[tokio::test]
    async fn test_rejection_from_previous_login_is_not_replayed_under_new_one() {
        let h = harness(Some(CredentialPair::new("A1", "R1")), Some("B1"), vec![]);
        let sent_with = h.coordinator.snapshot();
        assert_eq!(sent_with.access_token.as_deref(), Some("A1"));

        h.coordinator.end_session();
        h.coordinator.install(CredentialPair::new("B1", "S1"));

        let err = h
            .coordinator
            .handle_expired(ApiRequest::delete("/vault/rooms/7"), sent_with)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::SessionTerminated));
        assert!(h.transport.calls_with("B1").is_empty());
        assert_eq!(h.endpoint.calls(), 0);
        assert_eq!(h.coordinator.attempts_started(), 0);
        assert_eq!(h.store.read(), Some(CredentialPair::new("B1", "S1")));
    }

    #[tokio::test]
    async fn test_rejection_after_logout_is_terminated() {
        let h = harness(Some(CredentialPair::new("A1", "R1")), Some("A2"), vec![]);
        let sent_with = h.coordinator.snapshot();

        h.coordinator.end_session();

        let err = h
            .coordinator
            .handle_expired(ApiRequest::get("/vault"), sent_with)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SessionTerminated));
        assert_eq!(h.endpoint.calls(), 0);
    }

    struct PanickingEndpoint;

    #[async_trait]
    impl TokenEndpoint for PanickingEndpoint {
        async fn login(&self, _username: &str, _password: &str) -> Result<CredentialPair, ApiError> {
            Ok(CredentialPair::new("A1", "R1"))
        }

        async fn renew(&self, _refresh_token: &str) -> Result<CredentialPair, ApiError> {
            panic!("token endpoint crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_renewal_still_settles_the_attempt() {
        let backend = MemoryBackend::with_pair(CredentialPair::new("A1", "R1"));
        let store = Arc::new(CredentialStore::open(Box::new(backend)).unwrap());
        let transport = FakeTransport::accepting(Some("A2"));
        let terminator = Arc::new(SessionTerminator::new(store.clone()));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            Arc::new(PanickingEndpoint),
            transport.clone(),
            terminator,
        );
        let client = ApiClient::new(transport, coordinator.clone());

        let err = client.get("/vault").await.unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert!(store.read().is_none());

        // The coordinator is usable again afterwards
        let err = client.get("/vault").await.unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert_eq!(coordinator.attempts_started(), 1);
    }

    /// Like `wait_for_queue`, for runtimes where the requests run on other workers
    async fn wait_for_queue_on_workers(coordinator: &RefreshCoordinator, queued: usize) {
        let reached = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let CoordinatorState::Renewing { queued: n, .. } = coordinator.state() {
                    if n >= queued {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "queue never reached {} requests", queued);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_on_multi_thread_runtime() {
        let h = harness(
            Some(CredentialPair::new("A1", "R1")),
            Some("A2"),
            vec![Ok(CredentialPair::new("A2", "R2"))],
        );

        let paths: Vec<String> = (0..32).map(|i| format!("/req/{}", i)).collect();
        let handles: Vec<_> = paths
            .iter()
            .cloned()
            .map(|path| {
                let client = h.client.clone();
                tokio::spawn(async move { client.get(&path).await })
            })
            .collect();

        wait_for_queue_on_workers(&h.coordinator, paths.len()).await;
        h.endpoint.release();

        for (handle, path) in handles.into_iter().zip(&paths) {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(&response.text(), path);
        }

        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(h.coordinator.attempts_started(), 1);

        let mut replayed = h.transport.calls_with("A2");
        replayed.sort();
        let mut expected = paths.clone();
        expected.sort();
        assert_eq!(replayed, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replay_order_on_multi_thread_runtime() {
        let h = harness(
            Some(CredentialPair::new("A1", "R1")),
            Some("A2"),
            vec![Ok(CredentialPair::new("A2", "R2"))],
        );

        let paths: Vec<String> = (0..8).map(|i| format!("/ordered/{}", i)).collect();
        let mut handles = Vec::new();
        for (i, path) in paths.iter().cloned().enumerate() {
            let client = h.client.clone();
            handles.push(tokio::spawn(async move { client.get(&path).await }));
            wait_for_queue_on_workers(&h.coordinator, i + 1).await;
        }
        h.endpoint.release();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(h.transport.calls_with("A2"), paths);
    }

    #[test]
    fn test_take_attempt_checks_id() {
        let mut state = State::Renewing(RenewalAttempt {
            id: 7,
            queue: ReplayQueue::new(),
        });
        assert!(take_attempt(&mut state, 6).is_none());
        assert!(matches!(state, State::Renewing(_)));
        assert_eq!(take_attempt(&mut state, 7).map(|a| a.id), Some(7));
        assert!(matches!(state, State::Idle));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn prop_n_concurrent_expiries_renew_once(n in 1usize..16) {
                tokio_test::block_on(async {
                    let h = harness(
                        Some(CredentialPair::new("A1", "R1")),
                        Some("A2"),
                        vec![Ok(CredentialPair::new("A2", "R2"))],
                    );

                    let paths: Vec<String> = (0..n).map(|i| format!("/req/{}", i)).collect();
                    let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
                    let handles = send_queued(&h, &path_refs).await;
                    h.endpoint.release();

                    for (handle, path) in handles.into_iter().zip(&paths) {
                        let response = handle.await.unwrap().unwrap();
                        assert_eq!(&response.text(), path);
                    }

                    assert_eq!(h.endpoint.calls(), 1);
                    assert_eq!(h.transport.calls_with("A2"), paths);
                });
            }
        }
    }
}
