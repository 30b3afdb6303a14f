use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::ProgressUpdate;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&ProgressUpdate) -> bool + Send + Sync>;

/// Multi-subscriber fan-out of progress updates.
///
/// Listeners are plain callbacks returning `true` to stay subscribed; a
/// `false` return marks the listener dead (its observer went away) and it is
/// removed without disturbing the others. Broadcast iterates over a snapshot
/// of the listener list so no lock is held across listener invocation and
/// listeners registered mid-broadcast simply start with the next one.
#[derive(Default)]
pub struct ProgressBroadcaster {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl ProgressBroadcaster {
    /// Empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all future broadcasts.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ProgressUpdate) -> bool + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().expect("broadcaster lock poisoned");
        listeners.push((id, Arc::new(listener)));
        id
    }

    /// Deregister a listener. No-op if it is already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut listeners = self.listeners.lock().expect("broadcaster lock poisoned");
        listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    /// Number of live listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().expect("broadcaster lock poisoned").len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `(message, percent)` to every currently registered listener.
    ///
    /// Percent is clamped to 100. Listeners that report themselves dead are
    /// dropped after the sweep; delivery to the rest is unaffected.
    pub fn broadcast(&self, message: &str, percent: u8) {
        let update = ProgressUpdate {
            message: message.to_string(),
            percent: percent.min(100),
        };

        let snapshot: Vec<(SubscriptionId, Listener)> = {
            let listeners = self.listeners.lock().expect("broadcaster lock poisoned");
            listeners.clone()
        };

        let mut dead = Vec::new();
        for (id, listener) in &snapshot {
            if !listener(&update) {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            let mut listeners = self.listeners.lock().expect("broadcaster lock poisoned");
            listeners.retain(|(id, _)| !dead.contains(id));
        }
    }
}

impl std::fmt::Debug for ProgressBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBroadcaster")
            .field("listeners", &self.len())
            .finish()
    }
}
