//! The settlement cell: a once-only, thread-safe slot holding a promise's
//! state and the callbacks waiting on it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::Queue;
use crate::{Error, Promise};

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// What a work body or handler settles a promise with.
///
/// `Adopt` makes the promise follow another promise until that one reaches a
/// terminal state, however deeply promises are nested.
pub enum Resolution<T> {
    Fulfill(T),
    Reject(Error),
    Adopt(Promise<T>),
}

/// Conversion into a [`Resolution`], implemented for `Result<T, Error>`,
/// [`Promise<T>`] and `Resolution<T>` itself.
pub trait IntoResolution<T> {
    fn into_resolution(self) -> Resolution<T>;
}

impl<T> IntoResolution<T> for Resolution<T> {
    fn into_resolution(self) -> Resolution<T> {
        self
    }
}

impl<T> IntoResolution<T> for Result<T, Error> {
    fn into_resolution(self) -> Resolution<T> {
        match self {
            Ok(value) => Resolution::Fulfill(value),
            Err(err) => Resolution::Reject(err),
        }
    }
}

impl<T> IntoResolution<T> for Promise<T> {
    fn into_resolution(self) -> Resolution<T> {
        Resolution::Adopt(self)
    }
}

impl IntoResolution<()> for () {
    fn into_resolution(self) -> Resolution<()> {
        Resolution::Fulfill(())
    }
}

pub(crate) type Callback<T> = Box<dyn FnOnce(Result<T, Error>) + Send + 'static>;

struct Waiter<T> {
    queue: Option<Queue>,
    callback: Callback<T>,
}

enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
}

impl<T: Clone> State<T> {
    fn snapshot(&self) -> Option<Result<T, Error>> {
        match self {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(err) => Some(Err(err.clone())),
        }
    }
}

struct Inner<T> {
    state: State<T>,
    // Set once the cell follows another promise; only that promise may
    // settle it from then on.
    adopting: bool,
    waiters: Vec<Waiter<T>>,
}

pub(crate) struct Cell<T> {
    inner: Mutex<Inner<T>>,
    queue: Queue,
}

impl<T: Clone + Send + 'static> Cell<T> {
    /// A pending cell whose callbacks run on `queue` unless a subscriber
    /// asks for another one.
    pub(crate) fn new(queue: Queue) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: State::Pending,
                adopting: false,
                waiters: Vec::new(),
            }),
            queue,
        })
    }

    pub(crate) fn settled(queue: Queue, outcome: Result<T, Error>) -> Arc<Self> {
        let state = match outcome {
            Ok(value) => State::Fulfilled(value),
            Err(err) => State::Rejected(err),
        };
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state,
                adopting: false,
                waiters: Vec::new(),
            }),
            queue,
        })
    }

    pub(crate) fn queue(&self) -> &Queue {
        &self.queue
    }

    pub(crate) fn state(&self) -> PromiseState {
        match self.inner.lock().state {
            State::Pending => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub(crate) fn peek(&self) -> Option<Result<T, Error>> {
        self.inner.lock().state.snapshot()
    }

    /// Settles the cell. Calls after the cell is terminal, or after it has
    /// started adopting another promise, are ignored.
    pub(crate) fn settle(self: &Arc<Self>, resolution: Resolution<T>) {
        match resolution {
            Resolution::Fulfill(value) => self.settle_external(Ok(value)),
            Resolution::Reject(err) => self.settle_external(Err(err)),
            Resolution::Adopt(promise) => self.adopt(promise),
        }
    }

    fn settle_external(self: &Arc<Self>, outcome: Result<T, Error>) {
        if self.inner.lock().adopting {
            return;
        }
        self.complete(outcome);
    }

    fn adopt(self: &Arc<Self>, promise: Promise<T>) {
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, State::Pending) || inner.adopting {
                return;
            }
            inner.adopting = true;
        }
        if promise.shares_cell(self) {
            tracing::trace!("promise resolved with itself");
            self.complete(Err(Error::ChainCycle));
            return;
        }
        tracing::trace!("adopting nested promise");
        let this = Arc::clone(self);
        promise.subscribe(None, move |outcome| this.complete(outcome));
    }

    /// The one-way transition out of `Pending`.
    fn complete(&self, outcome: Result<T, Error>) {
        let waiters = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            inner.state = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(err) => State::Rejected(err.clone()),
            };
            std::mem::take(&mut inner.waiters)
        };
        tracing::trace!(
            fulfilled = outcome.is_ok(),
            waiters = waiters.len(),
            "promise settled"
        );
        for waiter in waiters {
            self.dispatch(waiter, outcome.clone());
        }
    }

    /// Runs `callback` with the terminal outcome: later if still pending,
    /// right away (through its queue) otherwise.
    pub(crate) fn subscribe(&self, queue: Option<Queue>, callback: Callback<T>) {
        let outcome = {
            let mut inner = self.inner.lock();
            let Some(outcome) = inner.state.snapshot() else {
                inner.waiters.push(Waiter { queue, callback });
                return;
            };
            outcome
        };
        self.dispatch(Waiter { queue, callback }, outcome);
    }

    fn dispatch(&self, waiter: Waiter<T>, outcome: Result<T, Error>) {
        let Waiter { queue, callback } = waiter;
        let queue = queue.as_ref().unwrap_or(&self.queue);
        queue.submit(Box::new(move || callback(outcome)));
    }
}
