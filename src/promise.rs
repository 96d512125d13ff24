use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::cell::{Cell, IntoResolution, PromiseState, Resolution};
use crate::deferred::Deferred;
use crate::executor::{default_queue, Queue};
use crate::Error;

/// Handle to the eventual result of a unit of work.
///
/// Cloning a promise is cheap and every clone observes the same settlement.
/// `then`, `catch` and `finally` never block: they register a continuation
/// and hand back a new pending promise.
///
/// # Examples
///
/// ```
/// use promise_kit::{Error, Promise};
/// use futures::executor::block_on;
///
/// let doubled = Promise::new(|c| c.fulfill(21)).then(|x| Ok(x * 2));
/// assert_eq!(block_on(doubled.wait()).unwrap(), 42);
///
/// let recovered = Promise::<i32>::reject(Error::msg("x")).catch(|_| Ok(1));
/// assert_eq!(block_on(recovered.wait()).unwrap(), 1);
/// ```
pub struct Promise<T> {
    source: Source<T>,
}

enum Source<T> {
    Cell(Arc<Cell<T>>),
    Deferred(Arc<Deferred<T>>),
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        let source = match &self.source {
            Source::Cell(cell) => Source::Cell(Arc::clone(cell)),
            Source::Deferred(deferred) => Source::Deferred(Arc::clone(deferred)),
        };
        Self { source }
    }
}

/// The resolver pair handed to a work body.
///
/// Only the first `resolve`/`reject` has an effect; later calls are ignored.
pub struct Continuation<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone + Send + 'static> Continuation<T> {
    pub(crate) fn new(cell: Arc<Cell<T>>) -> Self {
        Self { cell }
    }

    /// Settles with a value, an error, or another promise to follow.
    pub fn resolve(&self, resolution: impl IntoResolution<T>) {
        self.cell.settle(resolution.into_resolution());
    }

    pub fn fulfill(&self, value: T) {
        self.cell.settle(Resolution::Fulfill(value));
    }

    pub fn reject(&self, err: Error) {
        self.cell.settle(Resolution::Reject(err));
    }
}

/// Submits `body` to `queue`, rejecting the cell if the body panics.
pub(crate) fn spawn_body<T, F>(queue: &Queue, cell: Arc<Cell<T>>, body: F)
where
    T: Clone + Send + 'static,
    F: FnOnce(Continuation<T>) + Send + 'static,
{
    queue.submit(Box::new(move || {
        let continuation = Continuation::new(cell);
        let rescue = continuation.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || body(continuation))) {
            let err = Error::from_panic(payload);
            tracing::warn!(error = %err, "work body panicked");
            rescue.reject(err);
        }
    }));
}

/// Runs a handler, turning a panic into `Err`.
fn caught<R>(handler: impl FnOnce() -> R) -> Result<R, Error> {
    catch_unwind(AssertUnwindSafe(handler)).map_err(|payload| {
        let err = Error::from_panic(payload);
        tracing::warn!(error = %err, "promise handler panicked");
        err
    })
}

fn guarded<U>(handler: impl FnOnce() -> Resolution<U>) -> Resolution<U> {
    caught(handler).unwrap_or_else(Resolution::Reject)
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub(crate) fn from_cell(cell: Arc<Cell<T>>) -> Self {
        Self {
            source: Source::Cell(cell),
        }
    }

    pub(crate) fn from_deferred(deferred: Arc<Deferred<T>>) -> Self {
        Self {
            source: Source::Deferred(deferred),
        }
    }

    /// Runs `body` on the default queue.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(Continuation<T>) + Send + 'static,
    {
        Self::new_on(default_queue(), body)
    }

    /// Runs `body` on `queue`; continuations of the returned promise default
    /// to the same queue.
    pub fn new_on<F>(queue: Queue, body: F) -> Self
    where
        F: FnOnce(Continuation<T>) + Send + 'static,
    {
        let cell = Cell::new(queue.clone());
        spawn_body(&queue, Arc::clone(&cell), body);
        Self::from_cell(cell)
    }

    /// An already fulfilled promise. Nothing is submitted to an executor.
    pub fn resolve(value: T) -> Self {
        Self::from_cell(Cell::settled(default_queue(), Ok(value)))
    }

    /// An already rejected promise. Nothing is submitted to an executor.
    pub fn reject(err: Error) -> Self {
        Self::from_cell(Cell::settled(default_queue(), Err(err)))
    }

    /// A pending promise together with the resolvers that settle it.
    ///
    /// ```
    /// use promise_kit::Promise;
    /// use futures::executor::block_on;
    /// use std::thread;
    ///
    /// let (promise, resolvers) = Promise::<String>::with_resolvers();
    /// let task = thread::spawn(move || resolvers.fulfill("Hi".into()));
    /// assert_eq!(block_on(promise.wait()).unwrap(), "Hi");
    /// task.join().expect("The task thread has panicked.");
    /// ```
    pub fn with_resolvers() -> (Self, Continuation<T>) {
        Self::with_resolvers_on(default_queue())
    }

    pub fn with_resolvers_on(queue: Queue) -> (Self, Continuation<T>) {
        let cell = Cell::new(queue);
        (Self::from_cell(Arc::clone(&cell)), Continuation::new(cell))
    }

    fn current_cell(&self) -> Arc<Cell<T>> {
        match &self.source {
            Source::Cell(cell) => Arc::clone(cell),
            Source::Deferred(deferred) => deferred.current(),
        }
    }

    pub(crate) fn deferred(&self) -> Option<&Arc<Deferred<T>>> {
        match &self.source {
            Source::Cell(_) => None,
            Source::Deferred(deferred) => Some(deferred),
        }
    }

    pub(crate) fn queue(&self) -> Queue {
        match &self.source {
            Source::Cell(cell) => cell.queue().clone(),
            Source::Deferred(deferred) => deferred.queue().clone(),
        }
    }

    pub(crate) fn shares_cell(&self, cell: &Arc<Cell<T>>) -> bool {
        Arc::ptr_eq(&self.current_cell(), cell)
    }

    /// The cell a new subscriber waits on. Starts lazy work and retries a
    /// rejected retryable promise, so call it once per subscription.
    pub(crate) fn activate(&self) -> Arc<Cell<T>> {
        match &self.source {
            Source::Cell(cell) => Arc::clone(cell),
            Source::Deferred(deferred) => deferred.activate(),
        }
    }

    /// Registers `callback` for the terminal outcome. This counts as a
    /// subscription.
    pub(crate) fn subscribe<F>(&self, queue: Option<Queue>, callback: F)
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        self.activate().subscribe(queue, Box::new(callback));
    }

    pub fn state(&self) -> PromiseState {
        self.current_cell().state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// The terminal outcome, if there is one yet. Does not subscribe.
    pub fn peek(&self) -> Option<Result<T, Error>> {
        self.current_cell().peek()
    }

    /// Chains `on_fulfilled`; rejections pass through untouched.
    pub fn then<U, F, R>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoResolution<U>,
    {
        self.chain_then(None, on_fulfilled)
    }

    /// Like [`then`](Self::then) but runs the handler on `queue`.
    pub fn then_on<U, F, R>(&self, queue: Queue, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoResolution<U>,
    {
        self.chain_then(Some(queue), on_fulfilled)
    }

    /// Chains `on_rejected`; fulfilled values pass through untouched.
    pub fn catch<F, R>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Error) -> R + Send + 'static,
        R: IntoResolution<T>,
    {
        self.chain_catch(None, on_rejected)
    }

    pub fn catch_on<F, R>(&self, queue: Queue, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Error) -> R + Send + 'static,
        R: IntoResolution<T>,
    {
        self.chain_catch(Some(queue), on_rejected)
    }

    /// Runs `on_finally` once this promise settles either way, then forwards
    /// the original outcome. If the handler returns a promise, forwarding
    /// waits until that promise settles; its own outcome is ignored.
    ///
    /// A handler returning `Err` does not change the forwarded outcome
    /// either. Only a panicking handler rejects the returned promise, with
    /// [`Error::Panicked`].
    pub fn finally<U, F, R>(&self, on_finally: F) -> Promise<T>
    where
        U: Clone + Send + 'static,
        F: FnOnce() -> R + Send + 'static,
        R: IntoResolution<U>,
    {
        self.chain_finally(None, on_finally)
    }

    pub fn finally_on<U, F, R>(&self, queue: Queue, on_finally: F) -> Promise<T>
    where
        U: Clone + Send + 'static,
        F: FnOnce() -> R + Send + 'static,
        R: IntoResolution<U>,
    {
        self.chain_finally(Some(queue), on_finally)
    }

    fn chain_then<U, F, R>(&self, queue: Option<Queue>, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoResolution<U>,
    {
        let cell = Cell::new(self.queue());
        let output = Arc::clone(&cell);
        self.subscribe(queue, move |outcome| match outcome {
            Ok(value) => output.settle(guarded(move || on_fulfilled(value).into_resolution())),
            Err(err) => output.settle(Resolution::Reject(err)),
        });
        Promise::from_cell(cell)
    }

    fn chain_catch<F, R>(&self, queue: Option<Queue>, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Error) -> R + Send + 'static,
        R: IntoResolution<T>,
    {
        let cell = Cell::new(self.queue());
        let output = Arc::clone(&cell);
        self.subscribe(queue, move |outcome| match outcome {
            Ok(value) => output.settle(Resolution::Fulfill(value)),
            Err(err) => output.settle(guarded(move || on_rejected(err).into_resolution())),
        });
        Promise::from_cell(cell)
    }

    fn chain_finally<U, F, R>(&self, queue: Option<Queue>, on_finally: F) -> Promise<T>
    where
        U: Clone + Send + 'static,
        F: FnOnce() -> R + Send + 'static,
        R: IntoResolution<U>,
    {
        let cell = Cell::new(self.queue());
        let output = Arc::clone(&cell);
        self.subscribe(queue, move |outcome| {
            match caught(move || on_finally().into_resolution()) {
                Ok(Resolution::Adopt(pending)) => {
                    pending.subscribe(None, move |_| output.settle(outcome.into_resolution()));
                }
                Ok(Resolution::Fulfill(_) | Resolution::Reject(_)) => {
                    output.settle(outcome.into_resolution());
                }
                Err(panic) => output.settle(Resolution::Reject(panic)),
            }
        });
        Promise::from_cell(cell)
    }

    /// A future that subscribes once and resolves to the terminal outcome.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            promise: self.clone(),
            slot: None,
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .field("deferred", &self.deferred().is_some())
            .finish()
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        Wait {
            promise: self,
            slot: None,
        }
    }
}

/// Future returned by [`Promise::wait`].
pub struct Wait<T> {
    promise: Promise<T>,
    slot: Option<Arc<Mutex<Slot<T>>>>,
}

struct Slot<T> {
    outcome: Option<Result<T, Error>>,
    waker: Option<Waker>,
}

impl<T: Clone + Send + 'static> Future for Wait<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let slot = match this.slot.clone() {
            Some(slot) => slot,
            None => {
                let slot = Arc::new(Mutex::new(Slot {
                    outcome: None,
                    waker: None,
                }));
                this.slot = Some(Arc::clone(&slot));
                let filled = Arc::clone(&slot);
                this.promise.subscribe(None, move |outcome| {
                    let waker = {
                        let mut slot = filled.lock();
                        slot.outcome = Some(outcome);
                        slot.waker.take()
                    };
                    if let Some(waker) = waker {
                        waker.wake()
                    }
                });
                slot
            }
        };
        let mut slot = slot.lock();
        match slot.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Immediate;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn immediate() -> Queue {
        Arc::new(Immediate)
    }

    #[test]
    fn test_then_adds_one() {
        let p = Promise::resolve(5).then(|x| Ok(x + 1));
        assert_eq!(block_on(p.wait()).unwrap(), 6);
    }

    #[test]
    fn test_catch_recovers() {
        let p = Promise::<i32>::reject(Error::msg("x")).catch(|_| Ok(1));
        assert_eq!(block_on(p.wait()).unwrap(), 1);
    }

    #[test]
    fn test_rejection_skips_then() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let p = Promise::<i32>::reject(Error::msg("skipped"))
            .then(move |x| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(x)
            })
            .then(|x| Ok(x * 2));
        let err = block_on(p.wait()).unwrap_err();
        assert_eq!(err.to_string(), "skipped");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fulfillment_skips_catch() {
        let p = Promise::resolve("kept").catch(|_| Ok("replaced"));
        assert_eq!(block_on(p.wait()).unwrap(), "kept");
    }

    #[test]
    fn test_handler_returning_promise_is_adopted() {
        let p = Promise::resolve(2).then(|x| {
            Promise::new(move |c| {
                thread::sleep(Duration::from_millis(10));
                c.fulfill(x * 10)
            })
        });
        assert_eq!(block_on(p.wait()).unwrap(), 20);
    }

    #[test]
    fn test_nested_resolution_collapses() {
        let innermost = Promise::new(|c| c.fulfill("deep"));
        let middle = Promise::new(move |c| c.resolve(innermost));
        let outer = Promise::new(move |c| c.resolve(middle));
        assert_eq!(block_on(outer.wait()).unwrap(), "deep");
    }

    #[test]
    fn test_adopts_rejection() {
        let p = Promise::<u8>::new(|c| c.resolve(Promise::reject(Error::msg("inner"))));
        assert_eq!(block_on(p.wait()).unwrap_err().to_string(), "inner");
    }

    #[test]
    fn test_panicking_handler_rejects() {
        let p = Promise::resolve(1).then(|_| -> Result<i32, Error> { panic!("handler exploded") });
        let err = block_on(p.wait()).unwrap_err();
        assert!(matches!(err, Error::Panicked(ref m) if m == "handler exploded"));
    }

    #[test]
    fn test_panicking_body_rejects() {
        let p = Promise::<i32>::new(|_| panic!("body exploded"));
        assert!(matches!(block_on(p.wait()), Err(Error::Panicked(_))));
    }

    #[test]
    fn test_double_resolve_keeps_first() {
        let p = Promise::new_on(immediate(), |c| {
            c.fulfill(1);
            c.fulfill(2);
            c.reject(Error::msg("late"));
        });
        assert_eq!(p.state(), PromiseState::Fulfilled);
        assert_eq!(p.peek().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_resolving_with_itself_is_a_cycle() {
        let (p, resolvers) = Promise::<i32>::with_resolvers_on(immediate());
        resolvers.resolve(p.clone());
        assert!(matches!(p.peek(), Some(Err(Error::ChainCycle))));
    }

    #[test]
    fn test_finally_forwards_original_outcome() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let p = Promise::resolve(3).finally(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(block_on(p.wait()).unwrap(), 3);

        let counter = Arc::clone(&ran);
        let p = Promise::<i32>::reject(Error::msg("kept")).finally(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(block_on(p.wait()).unwrap_err().to_string(), "kept");
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_finally_waits_for_returned_promise() {
        let (gate, open) = Promise::<()>::with_resolvers();
        let p = Promise::resolve("value").finally(move || gate);
        thread::sleep(Duration::from_millis(20));
        assert!(p.is_pending());
        open.fulfill(());
        assert_eq!(block_on(p.wait()).unwrap(), "value");
    }

    #[test]
    fn test_finally_ignores_returned_rejection() {
        let p = Promise::resolve(9).finally(|| Promise::<()>::reject(Error::msg("ignored")));
        assert_eq!(block_on(p.wait()).unwrap(), 9);
    }

    #[test]
    fn test_finally_returning_err_keeps_outcome() {
        let p = Promise::resolve(1)
            .finally(|| -> Result<(), Error> { Err(Error::msg("finally failed")) });
        assert_eq!(block_on(p.wait()).unwrap(), 1);

        // Only a real panic rejects, whatever error variant the handler returns.
        let p = Promise::resolve(2)
            .finally(|| -> Result<(), Error> { Err(Error::Panicked(String::from("returned"))) });
        assert_eq!(block_on(p.wait()).unwrap(), 2);
    }

    #[test]
    fn test_panicking_finally_rejects() {
        let p = Promise::resolve(3).finally(|| -> Result<(), Error> { panic!("boom") });
        let err = block_on(p.wait()).unwrap_err();
        assert!(matches!(err, Error::Panicked(ref m) if m == "boom"));
    }

    #[test]
    fn test_then_on_runs_on_requested_queue() {
        let pool: Queue = Arc::new(
            crate::executor::ThreadPool::builder()
                .num_threads(1)
                .thread_name("pinned")
                .build()
                .unwrap(),
        );
        let p = Promise::resolve(()).then_on(pool, |_| {
            Ok(thread::current().name().map(str::to_owned))
        });
        assert_eq!(block_on(p.wait()).unwrap().as_deref(), Some("pinned-0"));
    }

    #[test]
    fn test_concurrent_subscribe_and_settle() {
        for _ in 0..50 {
            let (p, resolvers) = Promise::<usize>::with_resolvers();
            let subscribers: Vec<_> = (0..4)
                .map(|i| {
                    let p = p.clone();
                    thread::spawn(move || block_on(p.then(move |v| Ok(v + i)).wait()))
                })
                .collect();
            let settler = thread::spawn(move || resolvers.fulfill(100));
            settler.join().expect("The settler thread has panicked");
            let mut results: Vec<_> = subscribers
                .into_iter()
                .map(|t| t.join().expect("A subscriber thread has panicked").unwrap())
                .collect();
            results.sort();
            assert_eq!(results, vec![100, 101, 102, 103]);
        }
    }

    #[test]
    fn test_promise_is_awaitable() {
        let p = Promise::new(|c| c.fulfill(String::from("🍓")));
        let value = block_on(async move { p.await });
        assert_eq!(value.unwrap(), "🍓");
    }
}
