use std::sync::{Condvar, Mutex};

/// One-shot completion signal.
///
/// Fires at most once (extra fires are no-ops) and never resets. Waiters
/// that arrive after the fire return immediately.
#[derive(Debug, Default)]
pub struct DoneSignal {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl DoneSignal {
    /// Fresh, unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, waking every current and future waiter.
    pub fn fire(&self) {
        let mut fired = self.fired.lock().expect("done signal lock poisoned");
        if !*fired {
            *fired = true;
            self.cv.notify_all();
        }
    }

    /// Block until the signal has fired.
    pub fn wait(&self) {
        let mut fired = self.fired.lock().expect("done signal lock poisoned");
        while !*fired {
            fired = self.cv.wait(fired).expect("done signal lock poisoned");
        }
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.fired.lock().expect("done signal lock poisoned")
    }
}
