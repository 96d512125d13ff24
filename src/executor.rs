//! Where promise work actually runs.
//!
//! The promise core never creates threads itself. Work bodies and
//! continuations are handed to an [`Executor`] as opaque jobs. A [`Queue`] is a
//! shared handle to an executor, used both as the process-wide default and as
//! the target of the `*_on` operators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::{unbounded, Sender};

use crate::Error;

/// A unit of work submitted to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to an executor; acts as the execution-queue selector.
pub type Queue = Arc<dyn Executor>;

/// Runs submitted jobs asynchronously, each exactly once.
pub trait Executor: Send + Sync + 'static {
    fn submit(&self, job: Job);
}

/// Runs every job on the submitting thread before the outermost `submit`
/// returns.
///
/// A job submitted from inside a running job is queued behind it instead of
/// running nested, so settling a long chain of promises takes constant stack.
/// Blocking on a promise from inside an `Immediate` job deadlocks if that
/// promise can only be settled by a queued job.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

std::thread_local! {
    // Jobs submitted while this thread is draining `Immediate` jobs.
    static BACKLOG: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

impl Executor for Immediate {
    fn submit(&self, job: Job) {
        let first = BACKLOG.with(|backlog| {
            let mut backlog = backlog.borrow_mut();
            match backlog.as_mut() {
                Some(jobs) => {
                    jobs.push_back(job);
                    None
                }
                None => {
                    *backlog = Some(VecDeque::new());
                    Some(job)
                }
            }
        });
        let Some(mut job) = first else {
            return;
        };
        let mut panicked = None;
        loop {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                panicked.get_or_insert(payload);
            }
            let next = BACKLOG.with(|backlog| {
                backlog.borrow_mut().as_mut().and_then(VecDeque::pop_front)
            });
            match next {
                Some(next) => job = next,
                None => break,
            }
        }
        BACKLOG.with(|backlog| backlog.borrow_mut().take());
        // The first panic reaches the outermost submitter once the backlog is empty.
        if let Some(payload) = panicked {
            resume_unwind(payload);
        }
    }
}

const THREADS_ENV: &str = "PROMISE_KIT_THREADS";
const THREAD_NAME_ENV: &str = "PROMISE_KIT_THREAD_NAME";
const DEFAULT_THREAD_NAME: &str = "promise-worker";

/// Settings for a [`ThreadPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub num_threads: usize,
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism().map_or(4, |n| n.get()),
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl PoolConfig {
    /// Reads `PROMISE_KIT_THREADS` and `PROMISE_KIT_THREAD_NAME`, falling back
    /// to the defaults for anything missing or malformed.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(THREADS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.num_threads = n,
                _ => tracing::warn!(value = %raw, "ignoring invalid {THREADS_ENV}"),
            }
        }
        if let Some(name) = lookup(THREAD_NAME_ENV) {
            if !name.trim().is_empty() {
                config.thread_name = name;
            }
        }
        config
    }
}

/// Fixed-size pool of worker threads fed from an unbounded job channel.
///
/// Dropping the pool closes the channel; workers finish the jobs already
/// queued and then exit.
///
/// ```
/// use promise_kit::executor::{Executor, ThreadPool};
/// use std::sync::mpsc::channel;
///
/// let pool = ThreadPool::builder().num_threads(2).build().unwrap();
/// let (tx, rx) = channel();
/// pool.submit(Box::new(move || tx.send(7).unwrap()));
/// assert_eq!(rx.recv().unwrap(), 7);
/// ```
#[derive(Debug)]
pub struct ThreadPool {
    sender: Sender<Job>,
    num_threads: usize,
}

impl ThreadPool {
    pub fn builder() -> Builder {
        Builder {
            config: PoolConfig::default(),
        }
    }

    pub fn with_config(config: PoolConfig) -> Result<Self, Error> {
        if config.num_threads == 0 {
            return Err(Error::InvalidConfig("a thread pool needs at least one thread".into()));
        }
        let (sender, receiver) = unbounded::<Job>();
        for index in 0..config.num_threads {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || {
                    tracing::trace!(worker = index, "starting");
                    for job in receiver.iter() {
                        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                            let err = Error::from_panic(payload);
                            tracing::warn!(worker = index, error = %err, "job panicked");
                        }
                    }
                    tracing::trace!(worker = index, "shutting down");
                })
                .map_err(|err| Error::InvalidConfig(format!("failed to spawn worker: {err}")))?;
        }
        Ok(Self {
            sender,
            num_threads: config.num_threads,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Executor for ThreadPool {
    fn submit(&self, job: Job) {
        if self.sender.send(job).is_err() {
            tracing::warn!("thread pool is shut down, dropping job");
        }
    }
}

/// Builder for [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct Builder {
    config: PoolConfig,
}

impl Builder {
    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = n;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<ThreadPool, Error> {
        ThreadPool::with_config(self.config)
    }
}

static DEFAULT_QUEUE: OnceLock<Queue> = OnceLock::new();

/// Installs the queue used when no queue is requested explicitly.
///
/// Must run before the first promise is created; afterwards the default is
/// fixed and this returns [`Error::DefaultQueueInstalled`].
pub fn set_default_queue(queue: Queue) -> Result<(), Error> {
    DEFAULT_QUEUE.set(queue).map_err(|_| Error::DefaultQueueInstalled)
}

/// The process-wide default queue, building a [`ThreadPool`] from
/// [`PoolConfig::from_env`] on first use.
pub fn default_queue() -> Queue {
    DEFAULT_QUEUE.get_or_init(build_default_queue).clone()
}

fn build_default_queue() -> Queue {
    let config = PoolConfig::from_env();
    match ThreadPool::with_config(config.clone()) {
        Ok(pool) => {
            tracing::debug!(threads = config.num_threads, "default thread pool started");
            Arc::new(pool)
        }
        Err(err) => {
            tracing::warn!(error = %err, "falling back to a single worker thread");
            match ThreadPool::builder().num_threads(1).build() {
                Ok(pool) => Arc::new(pool),
                Err(_) => Arc::new(Immediate),
            }
        }
    }
}
