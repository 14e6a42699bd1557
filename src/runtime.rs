//! The task queue every promise schedules its continuations on.
//!
//! Tasks are ordered by `(due tick, sequence)`. A task scheduled with
//! [`Runtime::schedule`] is due on the current tick, so it runs after every
//! task already queued for that tick. [`Runtime::set_timeout`] pushes a task
//! into the future of a virtual clock that only advances when a later task is
//! dequeued; nothing here touches wall time.
use crate::Error;
use futures::task::noop_waker_ref;
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    future::{Future, IntoFuture},
    pin::pin,
    rc::Rc,
    task::{Context, Poll},
};
use tracing::trace;

type Task = Box<dyn FnOnce()>;

/// Handle to a single-threaded task queue. Clones share the same queue.
#[derive(Clone)]
pub struct Runtime {
    queue: Rc<RefCell<Inner>>,
}

struct Inner {
    now: u64,
    next_seq: u64,
    tasks: BTreeMap<(u64, u64), Task>,
    turn_limit: Option<usize>,
}

/// Configures a [`Runtime`].
#[derive(Debug, Default, Clone)]
pub struct Builder {
    turn_limit: Option<usize>,
}

impl Builder {
    /// Bounds how many turns a single [`Runtime::run`] may take.
    pub fn turn_limit(mut self, limit: usize) -> Self {
        self.turn_limit = Some(limit);
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            queue: Rc::new(RefCell::new(Inner {
                now: 0,
                next_seq: 0,
                tasks: BTreeMap::new(),
                turn_limit: self.turn_limit,
            })),
        }
    }
}

impl Runtime {
    pub fn new() -> Self {
        Builder::default().build()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Queues `task` for a later turn of the current tick.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.set_timeout(0, task)
    }

    /// Queues `task` to run once the virtual clock reaches `now() + delay`.
    pub fn set_timeout<F>(&self, delay: u64, task: F)
    where
        F: FnOnce() + 'static,
    {
        let mut queue = self.queue.borrow_mut();
        let due = queue.now.saturating_add(delay);
        let seq = queue.next_seq;
        queue.next_seq += 1;
        trace!(due, seq, "task enqueued");
        queue.tasks.insert((due, seq), Box::new(task));
    }

    /// Runs the earliest queued task. Returns `false` if there was none.
    pub fn run_once(&self) -> bool {
        let task = {
            let mut queue = self.queue.borrow_mut();
            let Some(((due, seq), task)) = queue.tasks.pop_first() else {
                return false;
            };
            queue.now = queue.now.max(due);
            trace!(due, seq, "task dequeued");
            task
        };
        // The queue must not be borrowed here: tasks schedule more tasks.
        task();
        true
    }

    /// Runs tasks until the queue is empty and returns how many ran.
    pub fn run(&self) -> Result<usize, Error> {
        let limit = self.queue.borrow().turn_limit;
        let mut turns = 0;
        loop {
            if limit.is_some_and(|limit| turns >= limit) && self.pending_tasks() > 0 {
                return Err(Error::TurnLimit(turns));
            }
            if !self.run_once() {
                return Ok(turns);
            }
            turns += 1;
        }
    }

    /// Drives `future` to completion, running one queued task between polls.
    ///
    /// Fails with [`Error::Stalled`] if the queue empties first. The turn
    /// limit does not apply here.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, Error>
    where
        F: IntoFuture,
    {
        let mut future = pin!(future.into_future());
        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            if !self.run_once() {
                return Err(Error::Stalled);
            }
        }
    }

    /// Current virtual tick.
    pub fn now(&self) -> u64 {
        self.queue.borrow().now
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.borrow().tasks.len()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.queue.try_borrow() {
            Ok(queue) => f
                .debug_struct("Runtime")
                .field("now", &queue.now)
                .field("pending_tasks", &queue.tasks.len())
                .finish(),
            Err(_) => f.debug_struct("Runtime").finish_non_exhaustive(),
        }
    }
}
