//! Following a handler's result to a final settlement.
//!
//! A result can be a plain value, one of our own promises, or a foreign
//! [`Thenable`] that only promises to call one of two callbacks. Foreign
//! thenables are not trusted: they may call both callbacks, call one several
//! times, or fail after having already called back. Only the first callback
//! counts.
use crate::{guard, promise::Promise, Error};
use std::{cell::Cell, fmt, rc::Rc};
use tracing::{debug, trace};

/// Anything a promise can be resolved with.
pub enum Resolution<T, E> {
    /// Fulfill directly.
    Value(T),
    /// Adopt the outcome of another promise.
    Promise(Promise<T, E>),
    /// Adopt the outcome of a foreign thenable.
    Thenable(Box<dyn Thenable<T, E>>),
    /// Probe for a registration hook first. The probe may fail, which
    /// rejects, or may reveal that there is nothing to wait on.
    Lookup(Box<dyn FnOnce() -> Result<Resolution<T, E>, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn thenable<X>(thenable: X) -> Self
    where
        X: Thenable<T, E> + 'static,
    {
        Resolution::Thenable(Box::new(thenable))
    }

    pub fn lookup<F>(probe: F) -> Self
    where
        F: FnOnce() -> Result<Resolution<T, E>, E> + 'static,
    {
        Resolution::Lookup(Box::new(probe))
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(promise) => f.debug_tuple("Promise").field(promise).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
            Resolution::Lookup(_) => f.write_str("Lookup(..)"),
        }
    }
}

/// A foreign deferred value.
///
/// `then` is handed two callbacks and must eventually call one of them. An
/// `Err` return (or a panic) before either callback has run rejects the
/// promise being resolved; after that it is ignored.
///
/// Closures of the right shape are thenables already:
///
/// ```
/// use thenable::{Error, Promise, RejectFn, Resolution, ResolveFn, Runtime, State};
///
/// let rt = Runtime::new();
/// let foreign = |resolve: ResolveFn<i32, Error>, _: RejectFn<i32, Error>| -> Result<(), Error> {
///     resolve.fulfill(42);
///     Ok(())
/// };
/// let adopted = Promise::<i32, Error>::resolve(&rt, Resolution::thenable(foreign));
/// assert_eq!(adopted.state(), State::Fulfilled(42));
/// ```
pub trait Thenable<T, E> {
    fn then(self: Box<Self>, resolve: ResolveFn<T, E>, reject: RejectFn<T, E>) -> Result<(), E>;
}

impl<T, E, F> Thenable<T, E> for F
where
    F: FnOnce(ResolveFn<T, E>, RejectFn<T, E>) -> Result<(), E>,
{
    fn then(self: Box<Self>, resolve: ResolveFn<T, E>, reject: RejectFn<T, E>) -> Result<(), E> {
        (*self)(resolve, reject)
    }
}

/// Success callback handed to a [`Thenable`].
pub struct ResolveFn<T, E> {
    promise: Promise<T, E>,
    called: Rc<Cell<bool>>,
}

/// Failure callback handed to a [`Thenable`].
pub struct RejectFn<T, E> {
    promise: Promise<T, E>,
    called: Rc<Cell<bool>>,
}

impl<T, E> Clone for ResolveFn<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            called: self.called.clone(),
        }
    }
}

impl<T, E> Clone for RejectFn<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            called: self.called.clone(),
        }
    }
}

impl<T, E> ResolveFn<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn call(&self, resolution: Resolution<T, E>) {
        if self.called.replace(true) {
            trace!("ignoring repeated thenable callback");
            return;
        }
        resolve_into(&self.promise, resolution)
    }

    pub fn fulfill(&self, value: T) {
        self.call(Resolution::Value(value))
    }
}

impl<T, E> RejectFn<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn call(&self, reason: E) {
        if self.called.replace(true) {
            trace!("ignoring repeated thenable callback");
            return;
        }
        self.promise.settle(Err(reason))
    }
}

/// Drives `promise` to the settlement `resolution` stands for.
pub(crate) fn resolve_into<T, E>(promise: &Promise<T, E>, resolution: Resolution<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    match resolution {
        Resolution::Promise(other) if other.ptr_eq(promise) => {
            debug!("promise resolved with itself");
            promise.settle(Err(Error::ChainingCycle.into()));
        }
        Resolution::Promise(other) => {
            let (on_value, on_reason) = (promise.clone(), promise.clone());
            other.react(
                move |value| resolve_into(&on_value, Resolution::Value(value)),
                move |reason| on_reason.settle(Err(reason)),
            );
        }
        Resolution::Lookup(probe) => match guard(probe) {
            Ok(found) => resolve_into(promise, found),
            Err(reason) => promise.settle(Err(reason)),
        },
        Resolution::Thenable(thenable) => {
            let called = Rc::new(Cell::new(false));
            let resolve = ResolveFn {
                promise: promise.clone(),
                called: called.clone(),
            };
            let reject = RejectFn {
                promise: promise.clone(),
                called: called.clone(),
            };
            if let Err(reason) = guard(move || thenable.then(resolve, reject)) {
                if called.get() {
                    trace!("thenable failed after calling back; ignoring");
                } else {
                    promise.settle(Err(reason));
                }
            }
        }
        Resolution::Value(value) => promise.settle(Ok(value)),
    }
}
