// Replay queue for requests waiting on a credential renewal

use tokio::sync::oneshot;

use crate::error::ApiError;
use crate::http_client::{ApiRequest, ApiResponse};

pub(crate) type Outcome = Result<ApiResponse, ApiError>;

/// A request deferred until the current renewal settles
pub(crate) struct PendingRequest {
    request: ApiRequest,
    completion: oneshot::Sender<Outcome>,
}

impl PendingRequest {
    pub(crate) fn new(request: ApiRequest) -> (Self, oneshot::Receiver<Outcome>) {
        let (completion, receiver) = oneshot::channel();
        (
            Self {
                request,
                completion,
            },
            receiver,
        )
    }

    pub(crate) fn request(&self) -> &ApiRequest {
        &self.request
    }

    /// Deliver the outcome to the waiting caller
    pub(crate) fn complete(self, outcome: Outcome) {
        let request_id = self.request.id();
        if self.completion.send(outcome).is_err() {
            // Caller dropped its future; the outcome has nowhere to go
            tracing::debug!(request_id = %request_id, "Caller gone before outcome was delivered");
        }
    }
}

/// Ordered requests owned by one renewal attempt
#[derive(Default)]
pub(crate) struct ReplayQueue {
    pending: Vec<PendingRequest>,
}

impl ReplayQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a request; returns its position in the queue
    pub(crate) fn enqueue(&mut self, pending: PendingRequest) -> usize {
        self.pending.push(pending);
        self.pending.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Consume the queue front to back
    pub(crate) fn drain_in_order(self) -> impl Iterator<Item = PendingRequest> {
        self.pending.into_iter()
    }

    /// Resolve every queued request with the same failure
    pub(crate) fn fail_all(self, error: impl Fn() -> ApiError) {
        for pending in self.drain_in_order() {
            pending.complete(Err(error()));
        }
    }
}
