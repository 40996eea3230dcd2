// Session termination and session event fan-out

use std::sync::Arc;
use tokio::sync::broadcast;

use super::credentials::CredentialStore;
use super::types::{EndReason, SessionEvent};

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Clears credentials and tells the presentation layer the session is over.
///
/// Also carries the other session notifications so subscribers see one
/// ordered stream.
pub struct SessionTerminator {
    store: Arc<CredentialStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionTerminator {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { store, events }
    }

    /// Drop the in-memory credential and emit a single `Ended` notification.
    ///
    /// Does no I/O, so it can run under the coordinator's state lock; the
    /// caller flushes the store once that lock is released.
    pub(crate) fn terminate(&self, reason: EndReason) {
        if self.store.replace(None).is_some() {
            tracing::debug!("Credentials cleared");
        }
        tracing::info!(reason = ?reason, "Session ended");
        self.publish(SessionEvent::Ended { reason });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // No subscribers is fine: headless callers may not listen
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::CredentialPair;

    #[tokio::test]
    async fn test_terminate_clears_and_notifies() {
        let store = Arc::new(CredentialStore::in_memory());
        store.write(CredentialPair::new("A1", "R1"));

        let terminator = SessionTerminator::new(store.clone());
        let mut events = terminator.subscribe();

        terminator.terminate(EndReason::Expired);

        assert!(store.read().is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Ended {
                reason: EndReason::Expired
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_terminate_without_subscribers() {
        let store = Arc::new(CredentialStore::in_memory());
        let terminator = SessionTerminator::new(store.clone());
        terminator.terminate(EndReason::LoggedOut);
        terminator.terminate(EndReason::LoggedOut);
        assert!(store.read().is_none());
    }
}
