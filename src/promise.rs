//! The settle-once state machine and the chaining operators.
use crate::{
    guard,
    resolution::{resolve_into, Resolution},
    runtime::Runtime,
    Error,
};
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::{Future, IntoFuture},
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};
use tracing::{debug, trace};

/// Where a promise is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T: Clone, E: Clone> State<T, E> {
    /// The settled payload, cloned, or `None` while pending.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match self {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }
}

/// A deferred value that settles exactly once.
///
/// `Promise` is a handle: clones observe and settle the same state. Every
/// continuation receives its own clone of the payload, hence `T: Clone` and
/// `E: Clone`.
///
/// # Examples
///
/// ```
/// use thenable::{Error, Promise, Resolution, Runtime, State};
///
/// let rt = Runtime::new();
/// let (promise, resolve, _reject) = Promise::<&str, Error>::deferred(&rt);
/// let loud = promise.map(|s| s.to_uppercase());
///
/// resolve.fulfill("hi");
/// rt.run().unwrap();
/// assert_eq!(loud.state(), State::Fulfilled("HI".to_string()));
/// ```
pub struct Promise<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
    runtime: Runtime,
}

struct Inner<T, E> {
    state: State<T, E>,
    on_fulfilled: Vec<Box<dyn FnOnce(T)>>,
    on_rejected: Vec<Box<dyn FnOnce(E)>>,
    waker: Vec<Waker>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f.debug_struct("Promise").field("state", &inner.state).finish(),
            Err(_) => f.debug_struct("Promise").finish_non_exhaustive(),
        }
    }
}

/// The fulfilling half handed to an executor.
///
/// Shares one "already resolved" flag with its [`Reject`]: the first call of
/// either half wins, even if it only starts following another promise.
pub struct Resolve<T, E> {
    promise: Promise<T, E>,
    resolved: Rc<Cell<bool>>,
}

/// The rejecting half handed to an executor.
pub struct Reject<T, E> {
    promise: Promise<T, E>,
    resolved: Rc<Cell<bool>>,
}

impl<T, E> Clone for Resolve<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            resolved: self.resolved.clone(),
        }
    }
}

impl<T, E> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            resolved: self.resolved.clone(),
        }
    }
}

impl<T, E> Resolve<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Fulfills with `value` as-is. Ignored once resolved.
    pub fn fulfill(&self, value: T) {
        if self.resolved.replace(true) {
            trace!("ignoring fulfill of a resolved promise");
            return;
        }
        self.promise.settle(Ok(value))
    }

    /// Follows `resolution` (a value, a promise or a thenable) to settlement.
    /// Ignored once resolved.
    pub fn resolve(&self, resolution: Resolution<T, E>) {
        if self.resolved.replace(true) {
            trace!("ignoring resolve of a resolved promise");
            return;
        }
        resolve_into(&self.promise, resolution)
    }
}

impl<T, E> Reject<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Rejects with `reason`. Ignored once resolved.
    pub fn reject(&self, reason: E) {
        if self.resolved.replace(true) {
            trace!("ignoring reject of a resolved promise");
            return;
        }
        self.promise.settle(Err(reason))
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    pub(crate) fn pending(runtime: &Runtime) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                on_fulfilled: Vec::new(),
                on_rejected: Vec::new(),
                waker: Vec::new(),
            })),
            runtime: runtime.clone(),
        }
    }

    /// The first call wins; every later call is a no-op.
    pub(crate) fn settle(&self, outcome: Result<T, E>) {
        let mut inner = self.inner.borrow_mut();
        if !inner.state.is_pending() {
            trace!("ignoring settlement of a settled promise");
            return;
        }
        inner.state = match &outcome {
            Ok(value) => State::Fulfilled(value.clone()),
            Err(reason) => State::Rejected(reason.clone()),
        };
        let on_fulfilled = mem::take(&mut inner.on_fulfilled);
        let on_rejected = mem::take(&mut inner.on_rejected);
        let wakers = mem::take(&mut inner.waker);
        drop(inner);

        match outcome {
            Ok(value) => {
                debug!(callbacks = on_fulfilled.len(), "promise fulfilled");
                for callback in on_fulfilled {
                    callback(value.clone());
                }
            }
            Err(reason) => {
                debug!(callbacks = on_rejected.len(), "promise rejected");
                for callback in on_rejected {
                    callback(reason.clone());
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Registers a pair of reactions. Exactly one of them runs, always on a
    /// later turn of the runtime, never inside this call or inside `settle`.
    pub(crate) fn react<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + 'static,
        R: FnOnce(E) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        match inner.state.outcome() {
            Some(Ok(value)) => self.runtime.schedule(move || on_fulfilled(value)),
            Some(Err(reason)) => self.runtime.schedule(move || on_rejected(reason)),
            None => {
                let runtime = self.runtime.clone();
                inner.on_fulfilled.push(Box::new(move |value: T| {
                    runtime.schedule(move || on_fulfilled(value))
                }));
                let runtime = self.runtime.clone();
                inner.on_rejected.push(Box::new(move |reason: E| {
                    runtime.schedule(move || on_rejected(reason))
                }));
            }
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> State<T, E> {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().state.is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, State::Rejected(_))
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// A [`Future`] that completes with this promise's outcome.
    pub fn waiter(&self) -> Waiter<T, E> {
        Waiter {
            promise: self.clone(),
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a promise and runs `executor` synchronously with its two
    /// settle functions.
    ///
    /// If the executor returns `Err` or panics before settling, the promise
    /// is rejected with that reason.
    pub fn new<F>(runtime: &Runtime, executor: F) -> Self
    where
        F: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E>,
    {
        let promise = Self::pending(runtime);
        let (resolve, reject) = promise.settlers();
        let resolved = resolve.resolved.clone();
        if let Err(reason) = guard(move || executor(resolve, reject)) {
            if resolved.get() {
                trace!("executor failed after resolving; ignoring");
            } else {
                promise.settle(Err(reason));
            }
        }
        promise
    }

    /// A pending promise together with its settle functions.
    pub fn deferred(runtime: &Runtime) -> (Self, Resolve<T, E>, Reject<T, E>) {
        let promise = Self::pending(runtime);
        let (resolve, reject) = promise.settlers();
        (promise, resolve, reject)
    }

    fn settlers(&self) -> (Resolve<T, E>, Reject<T, E>) {
        let resolved = Rc::new(Cell::new(false));
        let resolve = Resolve {
            promise: self.clone(),
            resolved: resolved.clone(),
        };
        let reject = Reject {
            promise: self.clone(),
            resolved,
        };
        (resolve, reject)
    }

    /// Derives a promise from whichever handler matches the settlement.
    ///
    /// The handler runs on a later turn even if this promise is already
    /// settled. An `Err` or a panic from the handler rejects the derived
    /// promise; an `Ok` resolution is followed to settlement.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        let derived = Promise::pending(&self.runtime);
        let (fulfilled_target, rejected_target) = (derived.clone(), derived.clone());
        self.react(
            move |value| fulfilled_target.settle_with(guard(move || on_fulfilled(value))),
            move |reason| rejected_target.settle_with(guard(move || on_rejected(reason))),
        );
        derived
    }

    /// `then` with the rejection passed through unchanged.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.then(on_fulfilled, Err)
    }

    pub fn map<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.and_then(move |value| Ok(Resolution::Value(f(value))))
    }

    /// `then` with the value passed through unchanged.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// Runs `on_finally` on either outcome and then re-emits the original one.
    ///
    /// If `on_finally` resolves to a promise the outcome waits for it. If it
    /// fails, or the promise it returned rejects, that reason wins.
    pub fn finally<V, F>(&self, on_finally: F) -> Promise<T, E>
    where
        V: Clone + 'static,
        F: FnOnce() -> Result<Resolution<V, E>, E> + 'static,
    {
        let runtime = self.runtime.clone();
        let hook = Rc::new(Cell::new(Some(on_finally)));
        // Only one branch below ever runs, so the hook is taken at most once.
        let run_hook = move || -> Result<Promise<(), E>, E> {
            match hook.take() {
                Some(on_finally) => Ok(Promise::resolve(&runtime, on_finally()?).map(|_| ())),
                None => Ok(Promise::fulfilled(&runtime, ())),
            }
        };
        let run_hook_on_reject = run_hook.clone();
        self.then(
            move |value| {
                let done = run_hook()?;
                Ok(Resolution::Promise(done.map(move |_| value)))
            },
            move |reason| {
                let done = run_hook_on_reject()?;
                Ok(Resolution::Promise(done.and_then(move |_| Err(reason))))
            },
        )
    }

    fn settle_with(&self, result: Result<Resolution<T, E>, E>) {
        match result {
            Ok(resolution) => resolve_into(self, resolution),
            Err(reason) => self.settle(Err(reason)),
        }
    }
}

/// Awaits a [`Promise`]. Any number of waiters may exist for one promise.
pub struct Waiter<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Future for Waiter<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.promise.inner.borrow_mut();
        match inner.state.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                // Polled again before settlement: keep one entry per waker.
                if !inner.waker.iter().any(|waker| waker.will_wake(cx.waker())) {
                    inner.waker.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T, E> IntoFuture for Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Waiter<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        Waiter { promise: self }
    }
}

#[cfg(test)]
mod tests {
    use super::{Promise, State};
    use crate::{Error, Resolution, Runtime};
    use futures::executor::block_on;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn test_settle_once() {
        let rt = Runtime::new();
        let (promise, resolve, reject) = Promise::<i32, Error>::deferred(&rt);
        assert_eq!(promise.state(), State::Pending);
        resolve.fulfill(1);
        reject.reject(Error::reason("late"));
        resolve.fulfill(2);
        assert_eq!(promise.state(), State::Fulfilled(1));
        assert!(promise.is_fulfilled());
        assert!(!promise.is_rejected());
    }

    #[test]
    fn test_executor_err_rejects() {
        let rt = Runtime::new();
        let promise = Promise::<i32, Error>::new(&rt, |_, _| Err(Error::reason("boom")));
        assert_eq!(promise.state(), State::Rejected(Error::reason("boom")));
    }

    #[test]
    fn test_executor_err_after_settle_is_ignored() {
        let rt = Runtime::new();
        let promise = Promise::<i32, Error>::new(&rt, |resolve, _| {
            resolve.fulfill(9);
            Err(Error::reason("too late"))
        });
        assert_eq!(promise.state(), State::Fulfilled(9));
    }

    #[test]
    fn test_executor_panic_rejects() {
        let rt = Runtime::new();
        let promise = Promise::<i32, Error>::new(&rt, |_, _| -> Result<(), Error> {
            panic!("kaboom")
        });
        assert_eq!(promise.state(), State::Rejected(Error::Panicked("kaboom".into())));
    }

    #[test]
    fn test_then_waits_for_a_later_turn() {
        let rt = Runtime::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let promise = Promise::<i32, Error>::fulfilled(&rt, 5);
        let derived = promise.map(move |v| sink.borrow_mut().push(v));
        assert!(seen.borrow().is_empty());
        assert!(derived.is_pending());
        rt.run().unwrap();
        assert_eq!(*seen.borrow(), vec![5]);
        assert_eq!(derived.state(), State::Fulfilled(()));
    }

    #[test]
    fn test_handler_err_rejects_derived() {
        let rt = Runtime::new();
        let derived = Promise::<i32, Error>::fulfilled(&rt, 1)
            .and_then(|_| -> Result<Resolution<i32, Error>, Error> { Err(Error::reason("bad")) });
        rt.run().unwrap();
        assert_eq!(derived.state(), State::Rejected(Error::reason("bad")));
    }

    #[test]
    fn test_handler_panic_rejects_derived() {
        let rt = Runtime::new();
        let derived = Promise::<i32, Error>::fulfilled(&rt, 1)
            .and_then(|_| -> Result<Resolution<i32, Error>, Error> { panic!("in handler") });
        rt.run().unwrap();
        assert_eq!(derived.state(), State::Rejected(Error::Panicked("in handler".into())));
    }

    #[test]
    fn test_rejection_skips_and_then_until_catch() {
        let rt = Runtime::new();
        let recovered = Promise::<i32, Error>::reject(&rt, Error::reason("e"))
            .map(|v| v + 100)
            .catch(|reason| {
                assert_eq!(reason, Error::reason("e"));
                Ok(Resolution::Value(-1))
            });
        rt.run().unwrap();
        assert_eq!(recovered.state(), State::Fulfilled(-1));
    }

    #[test]
    fn test_catch_passes_values_through() {
        let rt = Runtime::new();
        let passed = Promise::<i32, Error>::fulfilled(&rt, 3)
            .catch(|_| Ok(Resolution::Value(0)));
        rt.run().unwrap();
        assert_eq!(passed.state(), State::Fulfilled(3));
    }

    #[test]
    fn test_finally_waits_for_returned_promise() {
        let rt = Runtime::new();
        let (gate, open, _) = Promise::<(), Error>::deferred(&rt);
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        let after = Promise::<i32, Error>::fulfilled(&rt, 7).finally(move || {
            *flag.borrow_mut() = true;
            Ok(Resolution::Promise(gate))
        });
        rt.run().unwrap();
        assert!(*ran.borrow());
        assert!(after.is_pending());
        open.fulfill(());
        rt.run().unwrap();
        assert_eq!(after.state(), State::Fulfilled(7));
    }

    #[test]
    fn test_finally_error_overrides_outcome() {
        let rt = Runtime::new();
        let after = Promise::<i32, Error>::reject(&rt, Error::reason("original"))
            .finally(|| -> Result<Resolution<(), Error>, Error> { Err(Error::reason("cleanup")) });
        rt.run().unwrap();
        assert_eq!(after.state(), State::Rejected(Error::reason("cleanup")));
    }

    #[test]
    fn test_waiter_completes_after_settlement() {
        let rt = Runtime::new();
        let (promise, resolve, _) = Promise::<i32, Error>::deferred(&rt);
        let first = promise.waiter();
        let second = promise.map(|v| v * 10);
        rt.schedule(move || resolve.fulfill(4));
        assert_eq!(rt.block_on(first), Ok(Ok(4)));
        rt.run().unwrap();
        assert_eq!(block_on(second.waiter()), Ok(40));
    }

    #[test]
    fn test_reject_after_following_a_promise_is_ignored() {
        let rt = Runtime::new();
        let (other, fulfill_other, _) = Promise::<i32, Error>::deferred(&rt);
        let promise = Promise::<i32, Error>::new(&rt, |resolve, reject| {
            resolve.resolve(Resolution::Promise(other));
            reject.reject(Error::reason("late"));
            Ok(())
        });
        assert!(promise.is_pending());
        fulfill_other.fulfill(1);
        rt.run().unwrap();
        assert_eq!(promise.state(), State::Fulfilled(1));
    }

    #[test]
    fn test_second_resolve_is_ignored() {
        let rt = Runtime::new();
        let first = Promise::<i32, Error>::fulfilled(&rt, 1);
        let (promise, resolve, _) = Promise::<i32, Error>::deferred(&rt);
        resolve.resolve(Resolution::Promise(first));
        resolve.resolve(Resolution::Value(5));
        resolve.fulfill(6);
        rt.run().unwrap();
        assert_eq!(promise.state(), State::Fulfilled(1));
    }

    #[test]
    fn test_executor_err_after_following_a_promise_is_ignored() {
        let rt = Runtime::new();
        let (other, fulfill_other, _) = Promise::<i32, Error>::deferred(&rt);
        let promise = Promise::<i32, Error>::new(&rt, |resolve, _| {
            resolve.resolve(Resolution::Promise(other));
            Err(Error::reason("too late"))
        });
        assert!(promise.is_pending());
        fulfill_other.fulfill(2);
        rt.run().unwrap();
        assert_eq!(promise.state(), State::Fulfilled(2));
    }

    #[test]
    fn test_waiter_keeps_one_waker_across_turns() {
        let rt = Runtime::new();
        let (promise, resolve, _) = Promise::<i32, Error>::deferred(&rt);
        for _ in 0..500 {
            rt.schedule(|| {});
        }
        let watched = promise.clone();
        rt.schedule(move || {
            assert!(watched.inner.borrow().waker.len() <= 1);
            resolve.fulfill(3);
        });
        assert_eq!(rt.block_on(promise.waiter()), Ok(Ok(3)));
        assert!(promise.inner.borrow().waker.is_empty());
    }

    #[test]
    fn test_debug_shows_state() {
        let rt = Runtime::new();
        let promise = Promise::<i32, Error>::fulfilled(&rt, 2);
        assert_eq!(format!("{:?}", promise), "Promise { state: Fulfilled(2) }");
    }
}
