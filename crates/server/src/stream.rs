use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use axum::response::sse::Event;
use futures::Stream;

use cadgate_engine::ProgressUpdate;

/// One SSE record queued for a single observer.
#[derive(Debug, Clone, PartialEq)]
pub enum EventFrame {
    /// A progress broadcast forwarded from the build.
    Progress(ProgressUpdate),
    /// Terminal: the build succeeded; payload is the worker's result JSON.
    Complete(serde_json::Value),
    /// Terminal: this observer's submission was superseded.
    Cancelled {
        /// Human-readable reason.
        message: String,
    },
    /// Terminal: the build (or the request itself) failed.
    Error {
        /// Failure description.
        error: String,
    },
}

impl EventFrame {
    pub fn into_event(self) -> Event {
        match self {
            EventFrame::Progress(update) => Event::default().event("progress").data(
                serde_json::json!({ "message": update.message, "progress": update.percent })
                    .to_string(),
            ),
            EventFrame::Complete(result) => {
                Event::default().event("complete").data(result.to_string())
            }
            EventFrame::Cancelled { message } => Event::default()
                .event("cancelled")
                .data(serde_json::json!({ "message": message }).to_string()),
            EventFrame::Error { error } => Event::default()
                .event("error")
                .data(serde_json::json!({ "error": error }).to_string()),
        }
    }
}

struct QueueState {
    frames: VecDeque<EventFrame>,
    /// The terminal frame has been queued; nothing more will be accepted.
    finished: bool,
    /// The response stream was dropped (client disconnect).
    client_gone: bool,
    waker: Option<Waker>,
}

/// Bounded per-observer frame queue bridging the worker thread to the SSE
/// response task.
///
/// Producers never block: when the queue is full the oldest progress frame
/// is dropped (latest wins). The terminal frame is always accepted and
/// closes the queue. Once the client is gone every push is a no-op and
/// reports the observer dead so the broadcaster can prune the listener.
pub struct ObserverQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl ObserverQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                finished: false,
                client_gone: false,
                waker: None,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("observer queue lock poisoned")
    }

    /// Queue a progress frame. Returns `false` once the observer is gone or
    /// already finished, so callers can drop their subscription.
    pub fn push_progress(&self, update: ProgressUpdate) -> bool {
        let mut state = self.lock();
        if state.client_gone || state.finished {
            return false;
        }
        if state.frames.len() >= self.capacity {
            if let Some(oldest) = state
                .frames
                .iter()
                .position(|frame| matches!(frame, EventFrame::Progress(_)))
            {
                state.frames.remove(oldest);
            }
        }
        state.frames.push_back(EventFrame::Progress(update));
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        true
    }

    /// Queue the terminal frame and close the queue. Exactly one terminal
    /// frame is delivered per observer; later calls are no-ops.
    pub fn finish(&self, frame: EventFrame) {
        let mut state = self.lock();
        if state.client_gone || state.finished {
            return;
        }
        state.frames.push_back(frame);
        state.finished = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

/// The observer's half of the queue: a stream of frames ending after the
/// terminal one. Dropping it (axum does so on client disconnect) marks the
/// observer gone.
pub struct EventStream {
    queue: Arc<ObserverQueue>,
}

impl EventStream {
    pub fn new(queue: Arc<ObserverQueue>) -> Self {
        Self { queue }
    }
}

impl Stream for EventStream {
    type Item = EventFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.queue.lock();
        if let Some(frame) = state.frames.pop_front() {
            return Poll::Ready(Some(frame));
        }
        if state.finished {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let mut state = self.queue.lock();
        state.client_gone = true;
        state.frames.clear();
        state.waker = None;
    }
}
