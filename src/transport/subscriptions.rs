//! Subscription bookkeeping for the event stream
//!
//! Tracks which meetings are subscribed on the transport and keeps the
//! directives idempotent. Bookkeeping clears itself when the transport
//! disconnects; subscriptions are NOT replayed automatically after a
//! reconnect — that is the session controller's call, since a reconnect
//! may coincide with a meeting-view change.

use super::{TransportClient, TransportError, TransportEvent};
use crate::protocol::{ClientFrame, MeetingRef};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub(crate) struct SubscriptionManager {
    transport: Arc<TransportClient>,
    active: Arc<Mutex<BTreeSet<MeetingRef>>>,
}

impl SubscriptionManager {
    pub(crate) fn new(transport: Arc<TransportClient>) -> Self {
        let active: Arc<Mutex<BTreeSet<MeetingRef>>> = Arc::new(Mutex::new(BTreeSet::new()));

        // Clear bookkeeping whenever the connection drops; a new
        // connection starts with no server-side subscriptions.
        let mut events = transport.subscribe_events();
        let watcher_set = active.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, TransportEvent::Disconnected) {
                    lock_set(&watcher_set).clear();
                    debug!("Cleared subscription bookkeeping on disconnect");
                }
            }
        });

        Self { transport, active }
    }

    /// Subscribe to a meeting's events. Idempotent per meeting
    /// reference: an already-tracked subscription sends nothing.
    pub(crate) async fn subscribe(&self, meeting: &MeetingRef) -> Result<(), TransportError> {
        if self.is_subscribed(meeting) {
            debug!("Already subscribed to meeting {}", meeting);
            return Ok(());
        }

        self.transport
            .send(&ClientFrame::subscribe(meeting))
            .await?;
        lock_set(&self.active).insert(meeting.clone());
        info!("Subscribed to meeting {}", meeting);
        Ok(())
    }

    /// Unsubscribe from a meeting's events. Best-effort: when the
    /// transport is already closed there is nothing to unsubscribe from.
    pub(crate) async fn unsubscribe(&self, meeting: &MeetingRef) {
        lock_set(&self.active).remove(meeting);

        if !self.transport.is_open() {
            return;
        }

        match self.transport.send(&ClientFrame::unsubscribe(meeting)).await {
            Ok(()) => info!("Unsubscribed from meeting {}", meeting),
            Err(e) => warn!("Failed to unsubscribe from meeting {}: {}", meeting, e),
        }
    }

    /// Whether a meeting is currently tracked as subscribed
    pub(crate) fn is_subscribed(&self, meeting: &MeetingRef) -> bool {
        lock_set(&self.active).contains(meeting)
    }

    /// Currently tracked subscriptions
    #[allow(dead_code)]
    pub(crate) fn active(&self) -> Vec<MeetingRef> {
        lock_set(&self.active).iter().cloned().collect()
    }

}

fn lock_set(set: &Mutex<BTreeSet<MeetingRef>>) -> std::sync::MutexGuard<'_, BTreeSet<MeetingRef>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SubscriptionManager {
        let (transport, _frames) =
            TransportClient::new("wss://api.example.com/ws", "key").unwrap();
        SubscriptionManager::new(Arc::new(transport))
    }

    #[tokio::test]
    async fn test_subscribe_requires_open_transport() {
        let manager = manager();
        let result = manager.subscribe(&MeetingRef::new("m1")).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert!(!manager.is_subscribed(&MeetingRef::new("m1")));
    }

    #[tokio::test]
    async fn test_unsubscribe_when_closed_is_silent() {
        let manager = manager();
        // No panic, no error surface
        manager.unsubscribe(&MeetingRef::new("m1")).await;
        assert!(manager.active().is_empty());
    }

}
