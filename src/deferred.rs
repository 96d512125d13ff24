//! Lazy and retryable promises.
//!
//! A deferred promise owns the work-producing function instead of a single
//! run of it. Each attempt gets its own settlement cell, so a cell never
//! goes back to pending; retrying swaps in a fresh cell instead.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cell::{Cell, PromiseState};
use crate::executor::{default_queue, Queue};
use crate::promise::{spawn_body, Continuation};
use crate::Promise;

type Body<T> = Arc<dyn Fn(Continuation<T>) + Send + Sync + 'static>;

/// Lifecycle of the work behind a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Lazy work that nobody has subscribed to yet.
    NotStarted,
    Running,
    Settled,
}

struct Attempt<T> {
    started: bool,
    count: usize,
    cell: Arc<Cell<T>>,
}

pub(crate) struct Deferred<T> {
    body: Body<T>,
    queue: Queue,
    retryable: bool,
    attempt: Mutex<Attempt<T>>,
}

impl<T: Clone + Send + 'static> Deferred<T> {
    fn new(queue: Queue, body: Body<T>, lazy: bool, retryable: bool) -> Arc<Self> {
        let deferred = Arc::new(Self {
            body,
            queue: queue.clone(),
            retryable,
            attempt: Mutex::new(Attempt {
                started: false,
                count: 0,
                cell: Cell::new(queue),
            }),
        });
        if !lazy {
            deferred.activate();
        }
        deferred
    }

    pub(crate) fn queue(&self) -> &Queue {
        &self.queue
    }

    /// The cell of the latest attempt, without starting anything.
    pub(crate) fn current(&self) -> Arc<Cell<T>> {
        Arc::clone(&self.attempt.lock().cell)
    }

    /// The cell a new subscriber should wait on. Starts the first attempt,
    /// or a new one when the latest attempt rejected and retrying is on.
    pub(crate) fn activate(&self) -> Arc<Cell<T>> {
        let (cell, start) = {
            let mut attempt = self.attempt.lock();
            let start = if !attempt.started {
                attempt.started = true;
                true
            } else if self.retryable && attempt.cell.state() == PromiseState::Rejected {
                attempt.cell = Cell::new(self.queue.clone());
                true
            } else {
                false
            };
            if start {
                attempt.count += 1;
                if attempt.count == 1 {
                    tracing::debug!("starting deferred work");
                } else {
                    tracing::debug!(attempt = attempt.count, "retrying rejected work");
                }
            }
            (Arc::clone(&attempt.cell), start)
        };
        if start {
            let body = Arc::clone(&self.body);
            spawn_body(&self.queue, Arc::clone(&cell), move |c| body(c));
        }
        cell
    }

    pub(crate) fn phase(&self) -> Phase {
        let attempt = self.attempt.lock();
        if !attempt.started {
            Phase::NotStarted
        } else if attempt.cell.state() == PromiseState::Pending {
            Phase::Running
        } else {
            Phase::Settled
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempt.lock().count
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Defers `body` until the first subscription (`then`, `catch`,
    /// `finally`, awaiting, or use in a combinator).
    pub fn lazy<F>(body: F) -> Self
    where
        F: FnOnce(Continuation<T>) + Send + 'static,
    {
        Self::lazy_on(default_queue(), body)
    }

    pub fn lazy_on<F>(queue: Queue, body: F) -> Self
    where
        F: FnOnce(Continuation<T>) + Send + 'static,
    {
        let slot = Mutex::new(Some(body));
        let body: Body<T> = Arc::new(move |c| {
            let body = slot.lock().take();
            if let Some(body) = body {
                body(c)
            }
        });
        Self::from_deferred(Deferred::new(queue, body, true, false))
    }

    /// Runs `body` now; any subscription arriving after a rejection runs it
    /// again and only sees the new attempt.
    pub fn retryable<F>(body: F) -> Self
    where
        F: Fn(Continuation<T>) + Send + Sync + 'static,
    {
        Self::retryable_on(default_queue(), body)
    }

    pub fn retryable_on<F>(queue: Queue, body: F) -> Self
    where
        F: Fn(Continuation<T>) + Send + Sync + 'static,
    {
        Self::from_deferred(Deferred::new(queue, Arc::new(body), false, true))
    }

    /// Both lazy and retryable.
    ///
    /// ```
    /// use promise_kit::{Error, Promise};
    /// use futures::executor::block_on;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let calls = AtomicUsize::new(0);
    /// let p = Promise::lazy_and_retryable(move |c| {
    ///     if calls.fetch_add(1, Ordering::SeqCst) == 0 {
    ///         c.reject(Error::msg("flaky"));
    ///     } else {
    ///         c.fulfill("ok");
    ///     }
    /// });
    /// assert!(block_on(p.wait()).is_err());
    /// assert_eq!(block_on(p.wait()).unwrap(), "ok");
    /// ```
    pub fn lazy_and_retryable<F>(body: F) -> Self
    where
        F: Fn(Continuation<T>) + Send + Sync + 'static,
    {
        Self::lazy_and_retryable_on(default_queue(), body)
    }

    pub fn lazy_and_retryable_on<F>(queue: Queue, body: F) -> Self
    where
        F: Fn(Continuation<T>) + Send + Sync + 'static,
    {
        Self::from_deferred(Deferred::new(queue, Arc::new(body), true, true))
    }

    pub fn phase(&self) -> Phase {
        match self.deferred() {
            Some(deferred) => deferred.phase(),
            None if self.is_pending() => Phase::Running,
            None => Phase::Settled,
        }
    }

    /// How many times the work body has been started. Plain promises
    /// always report one.
    pub fn attempts(&self) -> usize {
        self.deferred().map_or(1, |deferred| deferred.attempts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Immediate;
    use crate::Error;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn counting(rejections: usize) -> (Arc<AtomicUsize>, impl Fn(Continuation<usize>) + Send + Sync) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let body = move |c: Continuation<usize>| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= rejections {
                c.reject(Error::msg(format!("attempt {n} failed")));
            } else {
                c.fulfill(n);
            }
        };
        (calls, body)
    }

    #[test]
    fn test_lazy_waits_for_subscription() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let p = Promise::lazy(move |c| {
            seen.fetch_add(1, Ordering::SeqCst);
            c.fulfill(7)
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(p.phase(), Phase::NotStarted);
        assert!(p.peek().is_none());

        assert_eq!(block_on(p.then(|x| Ok(x + 1)).wait()).unwrap(), 8);
        assert_eq!(block_on(p.wait()).unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.phase(), Phase::Settled);
    }

    #[test]
    fn test_lazy_does_not_retry() {
        let (calls, body) = counting(1);
        let p = Promise::lazy(body);
        assert!(block_on(p.wait()).is_err());
        assert!(block_on(p.wait()).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retryable_runs_eagerly_and_retries_after_rejection() {
        let (calls, body) = counting(1);
        let p = Promise::retryable_on(Arc::new(Immediate), body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.state(), PromiseState::Rejected);
        assert_eq!(p.peek().unwrap().unwrap_err().to_string(), "attempt 1 failed");

        assert_eq!(block_on(p.wait()).unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(p.attempts(), 2);

        // Fulfilled attempts are final.
        assert_eq!(block_on(p.wait()).unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_early_subscriber_is_not_renotified() {
        let (gate, open) = Promise::<()>::with_resolvers();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let p = Promise::retryable(move |c: Continuation<usize>| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                gate.then(move |_| -> Result<(), Error> {
                    c.reject(Error::msg("first"));
                    Ok(())
                });
            } else {
                c.fulfill(n);
            }
        });
        let early = p.then(|n| Ok(n * 100));
        open.fulfill(());
        assert_eq!(block_on(early.wait()).unwrap_err().to_string(), "first");
        assert_eq!(block_on(p.then(|n| Ok(n * 100)).wait()).unwrap(), 200);
        assert_eq!(block_on(early.wait()).unwrap_err().to_string(), "first");
    }

    #[test]
    fn test_lazy_and_retryable() {
        let (calls, body) = counting(2);
        let p = Promise::lazy_and_retryable(body);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(block_on(p.wait()).is_err());
        assert!(block_on(p.catch(|_| Ok(0)).wait()).is_ok());
        assert_eq!(block_on(p.wait()).unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_plain_promise_phase() {
        let p = Promise::resolve(1);
        assert_eq!(p.phase(), Phase::Settled);
        assert_eq!(p.attempts(), 1);
        let (pending, _resolvers) = Promise::<i32>::with_resolvers();
        assert_eq!(pending.phase(), Phase::Running);
    }
}
