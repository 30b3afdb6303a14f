use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::api::{BuildError, CancelToken, ProgressUpdate, SubmitError, Worker};
use crate::broadcast::ProgressBroadcaster;
use crate::signal::DoneSignal;

/// Keyed, cancelable cache-of-one that collapses concurrent submissions.
///
/// At most one entry exists at a time. Submitting the current entry's key
/// joins it (or returns its cached outcome); submitting a different key
/// cancels the in-flight build and replaces the entry atomically. Each entry
/// runs its worker exactly once, on a dedicated thread.
///
/// This is a cheap handle; clones share the same cache.
pub struct SingleflightCache<K, R> {
    shared: Arc<Shared<K, R>>,
}

impl<K, R> Clone for SingleflightCache<K, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<K, R> {
    state: Mutex<Option<Entry<K, R>>>,
    next_identity: AtomicU64,
}

/// The sole live entry. All fields except `status` are immutable after
/// publication; everything is guarded by the cache mutex.
struct Entry<K, R> {
    key: K,
    identity: u64,
    status: EntryStatus<R>,
    broadcaster: Arc<ProgressBroadcaster>,
    cancel: CancelToken,
    done: Arc<DoneSignal>,
}

enum EntryStatus<R> {
    Loading,
    Complete(R),
    Error(String),
}

/// What `submit` decided to do while it held the lock.
enum Submitted<R> {
    /// Terminal outcome already available.
    Ready(Result<R, SubmitError>),
    /// Parked on an entry; wait for `done`, then re-check `identity`.
    Parked { identity: u64, done: Arc<DoneSignal> },
}

impl<K, R> SingleflightCache<K, R>
where
    K: Eq + Clone + Send + std::fmt::Display + 'static,
    R: Clone + Send + 'static,
{
    /// Empty cache.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(None),
                next_identity: AtomicU64::new(1),
            }),
        }
    }

    /// Request the build identified by `key`, blocking until a terminal
    /// outcome is available for it.
    ///
    /// - If the current entry matches `key`, this joins it: a cached result
    ///   or error is returned immediately (a cached result is announced to
    ///   `progress` as a single `("cached", 100)` courtesy update), and an
    ///   in-flight build is waited on.
    /// - Otherwise the current entry (if any) is cancelled and replaced, and
    ///   `worker` runs on a fresh worker thread.
    ///
    /// `progress` receives every broadcast from the joined entry from the
    /// moment of subscription; missed earlier updates are not replayed.
    pub fn submit<F>(&self, key: K, worker: Worker<R>, progress: Option<F>) -> Result<R, SubmitError>
    where
        F: Fn(&ProgressUpdate) -> bool + Send + Sync + 'static,
    {
        let (identity, done) = match self.join_or_install(key, worker, progress) {
            Submitted::Ready(outcome) => return outcome,
            Submitted::Parked { identity, done } => (identity, done),
        };

        done.wait();

        let state = self.lock_state();
        match state.as_ref() {
            Some(entry) if entry.identity == identity => match &entry.status {
                EntryStatus::Complete(result) => Ok(result.clone()),
                EntryStatus::Error(message) => Err(SubmitError::Worker(message.clone())),
                // `done` fires only after status leaves LOADING, so this arm
                // should be unreachable; fail safe as a lost race.
                EntryStatus::Loading => Err(SubmitError::Cancelled),
            },
            // Cleared (cancelled while current) or replaced by another key.
            _ => Err(SubmitError::Cancelled),
        }
    }

    /// Key of the current entry, if any.
    pub fn current_key(&self) -> Option<K> {
        self.lock_state().as_ref().map(|entry| entry.key.clone())
    }

    /// Cancel the current entry's build without replacing it. Used on
    /// shutdown; waiters observe a cancelled outcome.
    pub fn cancel_current(&self) {
        let state = self.lock_state();
        if let Some(entry) = state.as_ref() {
            debug!(key = %entry.key, "cancelling current build");
            entry.cancel.cancel();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<Entry<K, R>>> {
        self.shared.state.lock().expect("cache lock poisoned")
    }

    fn join_or_install<F>(&self, key: K, worker: Worker<R>, progress: Option<F>) -> Submitted<R>
    where
        F: Fn(&ProgressUpdate) -> bool + Send + Sync + 'static,
    {
        let old_done;
        let identity;
        let broadcaster;
        let cancel;
        let done;
        {
            let mut state = self.lock_state();

            if let Some(entry) = state.as_ref() {
                if entry.key == key {
                    match &entry.status {
                        EntryStatus::Complete(result) => {
                            let result = result.clone();
                            drop(state);
                            // Courtesy update so late observers still render
                            // a finished bar.
                            if let Some(listener) = progress {
                                listener(&ProgressUpdate {
                                    message: "cached".to_string(),
                                    percent: 100,
                                });
                            }
                            return Submitted::Ready(Ok(result));
                        }
                        EntryStatus::Error(message) => {
                            return Submitted::Ready(Err(SubmitError::Worker(message.clone())));
                        }
                        EntryStatus::Loading => {
                            if let Some(listener) = progress {
                                entry.broadcaster.subscribe(listener);
                            }
                            return Submitted::Parked {
                                identity: entry.identity,
                                done: entry.done.clone(),
                            };
                        }
                    }
                }
            }

            // Preempt-or-install. The old done signal must fire only after
            // the lock is released with the new entry in place, so its
            // waiters wake to an identity mismatch rather than an empty or
            // half-swapped slot.
            old_done = state.take().map(|old| {
                debug!(old_key = %old.key, new_key = %key, "preempting current build");
                old.cancel.cancel();
                old.done
            });

            identity = self.shared.next_identity.fetch_add(1, Ordering::Relaxed);
            broadcaster = Arc::new(ProgressBroadcaster::new());
            if let Some(listener) = progress {
                broadcaster.subscribe(listener);
            }
            cancel = CancelToken::new();
            done = Arc::new(DoneSignal::new());

            debug!(key = %key, identity, "installing build entry");
            *state = Some(Entry {
                key: key.clone(),
                identity,
                status: EntryStatus::Loading,
                broadcaster: broadcaster.clone(),
                cancel: cancel.clone(),
                done: done.clone(),
            });
        }

        if let Some(signal) = old_done {
            signal.fire();
        }

        self.spawn_worker(identity, worker, broadcaster, cancel, done.clone());

        Submitted::Parked { identity, done }
    }

    fn spawn_worker(
        &self,
        identity: u64,
        worker: Worker<R>,
        broadcaster: Arc<ProgressBroadcaster>,
        cancel: CancelToken,
        done: Arc<DoneSignal>,
    ) {
        let shared = Arc::clone(&self.shared);
        let thread_done = done.clone();
        let spawned = std::thread::Builder::new()
            .name("cadgate-build".to_string())
            .spawn(move || {
                let report =
                    move |message: &str, percent: u8| broadcaster.broadcast(message, percent);

                let outcome = worker(&report, &cancel);
                // A worker that bails out early once the token is set counts
                // as cancelled even if it returned a value.
                let outcome = match outcome {
                    Ok(_) if cancel.is_cancelled() => Err(BuildError::Cancelled),
                    other => other,
                };

                finish_entry(&shared, identity, outcome);
                thread_done.fire();
            });

        if let Err(err) = spawned {
            warn!(%err, "failed to spawn build worker thread");
            finish_entry(
                &self.shared,
                identity,
                Err(BuildError::Failed(format!("failed to spawn build thread: {err}"))),
            );
            done.fire();
        }
    }
}

impl<K, R> Default for SingleflightCache<K, R>
where
    K: Eq + Clone + Send + std::fmt::Display + 'static,
    R: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Record a worker outcome on the entry that produced it, leaving the slot
/// alone if that entry has been replaced: the successor owns it.
fn finish_entry<K, R>(shared: &Shared<K, R>, identity: u64, outcome: Result<R, BuildError>)
where
    K: std::fmt::Display,
{
    let mut state = shared.state.lock().expect("cache lock poisoned");
    let is_current = matches!(state.as_ref(), Some(entry) if entry.identity == identity);

    match outcome {
        Ok(result) => {
            if let Some(entry) = state.as_mut().filter(|_| is_current) {
                debug!(key = %entry.key, identity, "build complete");
                entry.status = EntryStatus::Complete(result);
            }
        }
        Err(BuildError::Cancelled) => {
            // Cancellation leaves no residue, but only the current entry may
            // clear the slot.
            if is_current {
                if let Some(entry) = state.take() {
                    debug!(key = %entry.key, identity, "build cancelled; clearing entry");
                }
            }
        }
        Err(BuildError::Failed(message)) => {
            if let Some(entry) = state.as_mut().filter(|_| is_current) {
                debug!(key = %entry.key, identity, error = %message, "build failed");
                entry.status = EntryStatus::Error(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    type Cache = SingleflightCache<String, String>;

    fn key(s: &str) -> String {
        s.to_string()
    }

    /// Poll until the cache's current key matches, so joins in these tests
    /// never race entry installation.
    fn wait_for_key(cache: &Cache, expected: &str) {
        for _ in 0..500 {
            if cache.current_key().as_deref() == Some(expected) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("entry for {expected:?} never appeared");
    }

    fn recording_listener(
        log: Arc<StdMutex<Vec<(String, u8)>>>,
    ) -> impl Fn(&ProgressUpdate) -> bool + Send + Sync + 'static {
        move |update: &ProgressUpdate| {
            log.lock().unwrap().push((update.message.clone(), update.percent));
            true
        }
    }

    /// A worker that reports three phases and returns, pausing before each
    /// report so observers can pile on.
    fn phased_worker(runs: Arc<AtomicUsize>) -> Worker<String> {
        Box::new(move |report, cancel| {
            runs.fetch_add(1, Ordering::SeqCst);
            for (message, percent) in [("load", 25u8), ("build", 75), ("done", 100)] {
                if cancel.is_cancelled() {
                    return Err(BuildError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(25));
                report(message, percent);
            }
            Ok("result".to_string())
        })
    }

    /// A worker that spins until its token is set, then reports what it was
    /// told to do next.
    fn obedient_worker(after_cancel: Result<String, BuildError>) -> Worker<String> {
        Box::new(move |_report, cancel| {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            after_cancel
        })
    }

    #[test]
    fn concurrent_submissions_share_one_worker() {
        let cache = Cache::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let cache = cache.clone();
                let runs = runs.clone();
                std::thread::spawn(move || {
                    cache.submit(key("k"), phased_worker(runs), None::<fn(&ProgressUpdate) -> bool>)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), "result");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.current_key(), Some(key("k")));
    }

    #[test]
    fn observers_share_the_progress_stream() {
        let cache = Cache::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let a = Arc::new(StdMutex::new(Vec::new()));
        let b = Arc::new(StdMutex::new(Vec::new()));

        let first = {
            let cache = cache.clone();
            let runs = runs.clone();
            let a = a.clone();
            std::thread::spawn(move || {
                cache.submit(key("k"), phased_worker(runs), Some(recording_listener(a)))
            })
        };
        wait_for_key(&cache, "k");
        let second = {
            let cache = cache.clone();
            let runs = runs.clone();
            let b = b.clone();
            std::thread::spawn(move || {
                cache.submit(key("k"), phased_worker(runs), Some(recording_listener(b)))
            })
        };

        assert_eq!(first.join().unwrap().unwrap(), "result");
        assert_eq!(second.join().unwrap().unwrap(), "result");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let expected = vec![
            ("load".to_string(), 25),
            ("build".to_string(), 75),
            ("done".to_string(), 100),
        ];
        assert_eq!(*a.lock().unwrap(), expected);
        assert_eq!(*b.lock().unwrap(), expected);
    }

    #[test]
    fn complete_entry_serves_cached_result_with_courtesy_update() {
        let cache = Cache::new();
        let runs = Arc::new(AtomicUsize::new(0));
        cache
            .submit(key("k"), phased_worker(runs.clone()), None::<fn(&ProgressUpdate) -> bool>)
            .unwrap();

        let log = Arc::new(StdMutex::new(Vec::new()));
        let hit = cache
            .submit(key("k"), phased_worker(runs.clone()), Some(recording_listener(log.clone())))
            .unwrap();

        assert_eq!(hit, "result");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec![("cached".to_string(), 100)]);
    }

    #[test]
    fn error_is_cached_and_fanned_out() {
        let cache = Cache::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let failing: Worker<String> = {
            let runs = runs.clone();
            Box::new(move |report, _cancel| {
                runs.fetch_add(1, Ordering::SeqCst);
                report("load", 30);
                std::thread::sleep(Duration::from_millis(50));
                Err(BuildError::Failed("spreadsheet error".to_string()))
            })
        };

        let first = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(key("k"), failing, None::<fn(&ProgressUpdate) -> bool>)
            })
        };
        wait_for_key(&cache, "k");
        let second = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(
                    key("k"),
                    Box::new(|_, _| Ok("unused".to_string())),
                    None::<fn(&ProgressUpdate) -> bool>,
                )
            })
        };
        let joined = vec![first, second];

        for handle in joined {
            match handle.join().unwrap() {
                Err(SubmitError::Worker(message)) => assert_eq!(message, "spreadsheet error"),
                other => panic!("expected worker error, got {other:?}"),
            }
        }

        // A late arrival sees the cached error immediately, with no worker run.
        match cache.submit(
            key("k"),
            Box::new(|_, _| Ok("unused".to_string())),
            None::<fn(&ProgressUpdate) -> bool>,
        ) {
            Err(SubmitError::Worker(message)) => assert_eq!(message, "spreadsheet error"),
            other => panic!("expected worker error, got {other:?}"),
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn new_key_preempts_and_replaces() {
        let cache = Cache::new();

        let first = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(
                    key("k1"),
                    obedient_worker(Err(BuildError::Cancelled)),
                    None::<fn(&ProgressUpdate) -> bool>,
                )
            })
        };
        wait_for_key(&cache, "k1");

        let runs = Arc::new(AtomicUsize::new(0));
        let second = cache.submit(key("k2"), phased_worker(runs), None::<fn(&ProgressUpdate) -> bool>);

        match first.join().unwrap() {
            Err(SubmitError::Cancelled) => {}
            other => panic!("expected cancelled, got {other:?}"),
        }
        assert_eq!(second.unwrap(), "result");
        assert_eq!(cache.current_key(), Some(key("k2")));
    }

    #[test]
    fn preempted_failure_does_not_clobber_successor() {
        let cache = Cache::new();

        // k1's worker holds until cancelled, then fails during shutdown.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let k1_worker: Worker<String> = Box::new(move |_report, cancel| {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            // Wait until the test confirms k2 is installed, then blow up.
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Err(BuildError::Failed("io error".to_string()))
        });

        let first = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(key("k1"), k1_worker, None::<fn(&ProgressUpdate) -> bool>)
            })
        };
        wait_for_key(&cache, "k1");

        let second = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(
                    key("k2"),
                    Box::new(|report, cancel| {
                        for _ in 0..20 {
                            if cancel.is_cancelled() {
                                return Err(BuildError::Cancelled);
                            }
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        report("done", 100);
                        Ok("k2 result".to_string())
                    }),
                    None::<fn(&ProgressUpdate) -> bool>,
                )
            })
        };

        // The preempted waiter must come back cancelled promptly.
        match first.join().unwrap() {
            Err(SubmitError::Cancelled) => {}
            other => panic!("expected cancelled, got {other:?}"),
        }
        assert_eq!(cache.current_key(), Some(key("k2")));

        // Now let k1's worker fail; k2 must be untouched by it.
        release_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.current_key(), Some(key("k2")));

        assert_eq!(second.join().unwrap().unwrap(), "k2 result");
        assert_eq!(cache.current_key(), Some(key("k2")));
    }

    #[test]
    fn resubmitting_original_key_after_preemption_starts_fresh() {
        let cache = Cache::new();

        let first = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(
                    key("k1"),
                    obedient_worker(Err(BuildError::Cancelled)),
                    None::<fn(&ProgressUpdate) -> bool>,
                )
            })
        };
        wait_for_key(&cache, "k1");

        // Preempt with k2, which itself spins until cancelled.
        let second = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(
                    key("k2"),
                    obedient_worker(Err(BuildError::Cancelled)),
                    None::<fn(&ProgressUpdate) -> bool>,
                )
            })
        };
        wait_for_key(&cache, "k2");
        assert!(matches!(first.join().unwrap(), Err(SubmitError::Cancelled)));

        // Back to k1: a brand new worker runs; the original result is not
        // replayed.
        let runs = Arc::new(AtomicUsize::new(0));
        let third = cache.submit(key("k1"), phased_worker(runs.clone()), None::<fn(&ProgressUpdate) -> bool>);
        assert!(matches!(second.join().unwrap(), Err(SubmitError::Cancelled)));
        assert_eq!(third.unwrap(), "result");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.current_key(), Some(key("k1")));
    }

    #[test]
    fn early_return_with_token_set_counts_as_cancelled() {
        let cache = Cache::new();

        // Worker returns Ok, but only after its token is set.
        let first = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(
                    key("k1"),
                    obedient_worker(Ok("partial".to_string())),
                    None::<fn(&ProgressUpdate) -> bool>,
                )
            })
        };
        wait_for_key(&cache, "k1");

        let runs = Arc::new(AtomicUsize::new(0));
        let second = cache.submit(key("k2"), phased_worker(runs), None::<fn(&ProgressUpdate) -> bool>);

        assert!(matches!(first.join().unwrap(), Err(SubmitError::Cancelled)));
        assert_eq!(second.unwrap(), "result");
    }

    #[test]
    fn cancel_current_clears_the_slot() {
        let cache = Cache::new();

        let first = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                cache.submit(
                    key("k"),
                    obedient_worker(Err(BuildError::Cancelled)),
                    None::<fn(&ProgressUpdate) -> bool>,
                )
            })
        };
        wait_for_key(&cache, "k");

        cache.cancel_current();
        assert!(matches!(first.join().unwrap(), Err(SubmitError::Cancelled)));
        assert_eq!(cache.current_key(), None);
    }

    #[test]
    fn progress_is_monotonic_per_observer() {
        let cache = Cache::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let worker: Worker<String> = Box::new(|report, _cancel| {
            for percent in [5u8, 20, 40, 60, 80, 100] {
                report("step", percent);
            }
            Ok("ok".to_string())
        });

        cache
            .submit(key("k"), worker, Some(recording_listener(log.clone())))
            .unwrap();

        let seen: Vec<u8> = log.lock().unwrap().iter().map(|(_, p)| *p).collect();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "not monotonic: {seen:?}");
    }
}
