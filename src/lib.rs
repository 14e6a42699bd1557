//! Settle-once promises driven by a single-threaded task queue.
//!
//! A [`Promise`] is either pending, fulfilled with a value or rejected with a
//! reason, and it settles at most once. Continuations attached with
//! [`Promise::then`] and friends never run inline: they are queued on the
//! [`Runtime`] and run on a later turn. A continuation may return another
//! promise or any foreign [`Thenable`], and the derived promise follows it.
//!
//! # Examples
//!
//! ```
//! use thenable::{Error, Promise, Resolution, Runtime, State};
//!
//! let rt = Runtime::new();
//! let doubled = Promise::<i32, Error>::fulfilled(&rt, 21)
//!     .and_then(|v| Ok(Resolution::Value(v * 2)));
//! assert!(doubled.is_pending());
//!
//! rt.run().unwrap();
//! assert_eq!(doubled.state(), State::Fulfilled(42));
//! ```
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::warn;

mod combinators;
pub mod promise;
pub mod resolution;
pub mod runtime;

pub use promise::{Promise, Reject, Resolve, State, Waiter};
pub use resolution::{RejectFn, Resolution, ResolveFn, Thenable};
pub use runtime::{Builder, Runtime};

/// Faults raised by the crate itself.
///
/// Reason types used with [`Promise`] must implement `From<Error>` so that
/// cycles and captured panics can be delivered as ordinary rejections. `Error`
/// is itself a usable reason type via [`Error::Rejected`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A promise was resolved with itself.
    #[error("chaining cycle detected for promise")]
    ChainingCycle,
    /// An executor, handler or thenable panicked.
    #[error("panicked: {0}")]
    Panicked(String),
    /// The task queue ran dry while the awaited future was still pending.
    #[error("task queue is empty but the future is still pending")]
    Stalled,
    /// `Runtime::run` hit its configured turn limit.
    #[error("turn limit of {0} exceeded")]
    TurnLimit(usize),
    /// A plain rejection reason, for callers without their own reason type.
    #[error("{0}")]
    Rejected(String),
}

impl Error {
    pub fn reason(reason: impl Into<String>) -> Self {
        Error::Rejected(reason.into())
    }
}

/// Runs `f`, turning a panic into `Err(Error::Panicked)`.
pub(crate) fn guard<R, E, F>(f: F) -> Result<R, E>
where
    E: From<Error>,
    F: FnOnce() -> Result<R, E>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            warn!(%message, "panic converted into rejection");
            Err(Error::Panicked(message).into())
        }
    }
}
