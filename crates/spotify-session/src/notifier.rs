//! Session change fan-out
//!
//! Listeners are invoked synchronously, in subscription order, on the task
//! that published the event. The listener list is snapshotted before
//! delivery so a listener may subscribe or unsubscribe from inside its
//! callback without deadlocking.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::trace;

use crate::session::Session;

/// One batch of session changes. Any of the lists may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionChangeEvent {
    pub added: Vec<Session>,
    pub removed: Vec<Session>,
    pub changed: Vec<Session>,
}

impl SessionChangeEvent {
    pub fn added(session: Session) -> Self {
        Self {
            added: vec![session],
            ..Self::default()
        }
    }

    pub fn removed(session: Session) -> Self {
        Self {
            removed: vec![session],
            ..Self::default()
        }
    }

    pub fn changed(session: Session) -> Self {
        Self {
            changed: vec![session],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

type Listener = Arc<dyn Fn(&SessionChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Publishes session changes to subscribers. Cheap to clone; clones share
/// one listener list.
#[derive(Clone, Default)]
pub struct SessionChangeNotifier {
    registry: Arc<Mutex<Registry>>,
}

impl SessionChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned
    /// `Subscription` is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionChangeEvent) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Subscribe through an unbounded channel, for consumers that would
    /// rather `recv().await` than run inside the publisher's task.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<SessionChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event| {
            // Receiver dropped; the subscription will be dropped with it
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Deliver `event` to every current listener.
    pub fn notify(&self, event: &SessionChangeEvent) {
        let listeners: Vec<Listener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        trace!(
            listeners = listeners.len(),
            added = event.added.len(),
            removed = event.removed.len(),
            changed = event.changed.len(),
            "publishing session change"
        );
        for listener in listeners {
            listener(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for one registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Unsubscribe now. Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
