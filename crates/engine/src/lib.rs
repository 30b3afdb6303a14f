#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Build coordination primitives for `cadgate`: a multi-subscriber progress
//! broadcaster and a cancelable singleflight cache-of-one.
//!
//! Everything here is synchronous and thread-safe. Workers run on dedicated
//! threads owned by the cache; async callers bridge in via
//! `tokio::task::spawn_blocking` (or equivalent).

/// Public API types shared across the engine.
pub mod api;

mod broadcast;
mod cache;
mod signal;

pub use api::{BuildError, CancelToken, ProgressUpdate, SubmitError, Worker};
pub use broadcast::{ProgressBroadcaster, SubscriptionId};
pub use cache::SingleflightCache;
pub use signal::DoneSignal;
