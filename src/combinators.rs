//! Promises derived from the concurrent outcomes of several inputs.
//!
//! Every combinator activates each input exactly once and then works on the
//! cell that activation hands back, so a retried input is only ever seen
//! through its new attempt. Inputs whose cell is already settled are
//! inspected first in index order, which makes ties resolve to the lowest
//! index.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cell::Cell;
use crate::{AggregateError, Error, Promise};

/// Outcome snapshot of one input of [`Promise::all_settled`].
#[derive(Debug, Clone)]
pub enum PromiseResult<T> {
    Fulfilled(T),
    Rejected(Error),
}

impl<T> PromiseResult<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, PromiseResult::Fulfilled(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            PromiseResult::Fulfilled(value) => Some(value),
            PromiseResult::Rejected(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            PromiseResult::Fulfilled(_) => None,
            PromiseResult::Rejected(err) => Some(err),
        }
    }

    pub fn into_result(self) -> Result<T, Error> {
        match self {
            PromiseResult::Fulfilled(value) => Ok(value),
            PromiseResult::Rejected(err) => Err(err),
        }
    }
}

impl<T> From<Result<T, Error>> for PromiseResult<T> {
    fn from(outcome: Result<T, Error>) -> Self {
        match outcome {
            Ok(value) => PromiseResult::Fulfilled(value),
            Err(err) => PromiseResult::Rejected(err),
        }
    }
}

struct Collect<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Collect<T> {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| None).collect(),
            remaining: len,
        }
    }

    /// Stores slot `index`; returns every slot once the last one arrives.
    fn fill(&mut self, index: usize, item: T) -> Option<Vec<T>> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(item);
                self.remaining -= 1;
            }
            _ => return None,
        }
        if self.remaining == 0 {
            Some(self.slots.drain(..).flatten().collect())
        } else {
            None
        }
    }
}

struct Rejections {
    errors: Vec<Option<Error>>,
    remaining: usize,
}

impl Rejections {
    fn new(len: usize) -> Self {
        Self {
            errors: vec![None; len],
            remaining: len,
        }
    }

    /// Records the rejection of input `index`; returns the aggregate once
    /// every input has rejected.
    fn record(&mut self, index: usize, err: Error) -> Option<AggregateError> {
        match self.errors.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(err);
                self.remaining -= 1;
            }
            _ => return None,
        }
        if self.remaining == 0 {
            Some(AggregateError::new(self.errors.drain(..).flatten().collect()))
        } else {
            None
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Fulfills with every value in input order once all inputs fulfill;
    /// rejects with the first rejection to arrive.
    ///
    /// Still-pending inputs keep running after a rejection; their outcomes
    /// are simply ignored.
    ///
    /// ```
    /// use promise_kit::{Error, Promise};
    /// use futures::executor::block_on;
    ///
    /// let all = Promise::all(vec![Promise::resolve(1), Promise::resolve(2)]);
    /// assert_eq!(block_on(all.wait()).unwrap(), vec![1, 2]);
    ///
    /// let all = Promise::all(vec![
    ///     Promise::resolve(1),
    ///     Promise::reject(Error::msg("y")),
    ///     Promise::resolve(3),
    /// ]);
    /// assert_eq!(block_on(all.wait()).unwrap_err().to_string(), "y");
    /// ```
    pub fn all(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        if promises.is_empty() {
            return Promise::resolve(Vec::new());
        }
        let (all, resolvers) = Promise::with_resolvers();
        let cells = activate_all(&promises);
        if let Some(err) = cells.iter().find_map(|cell| cell.peek().and_then(Result::err)) {
            resolvers.reject(err);
        }
        let collect = Arc::new(Mutex::new(Collect::new(cells.len())));
        for (index, cell) in cells.iter().enumerate() {
            let collect = Arc::clone(&collect);
            let resolvers = resolvers.clone();
            cell.subscribe(None, Box::new(move |outcome: Result<T, Error>| match outcome {
                Ok(value) => {
                    let done = collect.lock().fill(index, value);
                    if let Some(values) = done {
                        resolvers.fulfill(values);
                    }
                }
                Err(err) => resolvers.reject(err),
            }));
        }
        all
    }

    /// Waits for every input to settle and never rejects.
    pub fn all_settled(promises: Vec<Promise<T>>) -> Promise<Vec<PromiseResult<T>>> {
        if promises.is_empty() {
            return Promise::resolve(Vec::new());
        }
        let (settled, resolvers) = Promise::with_resolvers();
        let collect = Arc::new(Mutex::new(Collect::new(promises.len())));
        for (index, cell) in activate_all(&promises).iter().enumerate() {
            let collect = Arc::clone(&collect);
            let resolvers = resolvers.clone();
            cell.subscribe(None, Box::new(move |outcome: Result<T, Error>| {
                let done = collect.lock().fill(index, PromiseResult::from(outcome));
                if let Some(results) = done {
                    resolvers.fulfill(results);
                }
            }));
        }
        settled
    }

    /// Adopts the state of whichever input settles first. An empty input
    /// never settles.
    pub fn race(promises: Vec<Promise<T>>) -> Promise<T> {
        let (race, resolvers) = Promise::with_resolvers();
        let cells = activate_all(&promises);
        if let Some(outcome) = cells.iter().find_map(|cell| cell.peek()) {
            resolvers.resolve(outcome);
        }
        for cell in &cells {
            let resolvers = resolvers.clone();
            let settle = move |outcome: Result<T, Error>| resolvers.resolve(outcome);
            cell.subscribe(None, Box::new(settle));
        }
        race
    }

    /// Fulfills with the first input to fulfill; rejects with an
    /// [`AggregateError`] listing every rejection in input order if none do.
    pub fn any(promises: Vec<Promise<T>>) -> Promise<T> {
        let (any, resolvers) = Promise::with_resolvers();
        if promises.is_empty() {
            resolvers.reject(AggregateError::default().into());
            return any;
        }
        let cells = activate_all(&promises);
        if let Some(value) = cells.iter().find_map(|cell| cell.peek().and_then(Result::ok)) {
            resolvers.fulfill(value);
        }
        let rejections = Arc::new(Mutex::new(Rejections::new(cells.len())));
        for (index, cell) in cells.iter().enumerate() {
            let rejections = Arc::clone(&rejections);
            let resolvers = resolvers.clone();
            cell.subscribe(None, Box::new(move |outcome: Result<T, Error>| match outcome {
                Ok(value) => resolvers.fulfill(value),
                Err(err) => {
                    let aggregate = rejections.lock().record(index, err);
                    if let Some(aggregate) = aggregate {
                        resolvers.reject(aggregate.into());
                    }
                }
            }));
        }
        any
    }

    /// Prefers the value of the first input. If it rejects, falls back to the
    /// earliest fulfillment among the others; if everything rejects, rejects
    /// with an [`AggregateError`] in input order.
    ///
    /// Unlike [`any`](Self::any), a faster later input does not win while
    /// the first input is still pending.
    pub fn first_priority(promises: Vec<Promise<T>>) -> Promise<T> {
        let (first, resolvers) = Promise::with_resolvers();
        if promises.is_empty() {
            resolvers.reject(AggregateError::default().into());
            return first;
        }
        let cells = activate_all(&promises);
        let priority = Arc::new(Mutex::new(Priority::new(cells.len())));
        for (index, cell) in cells.iter().enumerate() {
            if let Some(outcome) = cell.peek() {
                let settle = priority.lock().observe(index, outcome);
                if let Some(outcome) = settle {
                    resolvers.resolve(outcome);
                }
            }
        }
        for (index, cell) in cells.iter().enumerate() {
            let priority = Arc::clone(&priority);
            let resolvers = resolvers.clone();
            cell.subscribe(None, Box::new(move |outcome: Result<T, Error>| {
                let settle = priority.lock().observe(index, outcome);
                if let Some(outcome) = settle {
                    resolvers.resolve(outcome);
                }
            }));
        }
        first
    }
}

fn activate_all<T: Clone + Send + 'static>(promises: &[Promise<T>]) -> Vec<Arc<Cell<T>>> {
    promises.iter().map(Promise::activate).collect()
}

struct Priority<T> {
    primary_rejected: bool,
    fallback: Option<T>,
    rejections: Rejections,
    seen: Vec<bool>,
}

impl<T: Clone> Priority<T> {
    fn new(len: usize) -> Self {
        Self {
            primary_rejected: false,
            fallback: None,
            rejections: Rejections::new(len),
            seen: vec![false; len],
        }
    }

    /// Feeds the outcome of input `index`; returns what the output should
    /// settle with, if anything yet.
    fn observe(&mut self, index: usize, outcome: Result<T, Error>) -> Option<Result<T, Error>> {
        if std::mem::replace(&mut self.seen[index], true) {
            return None;
        }
        match (index, outcome) {
            (0, Ok(value)) => Some(Ok(value)),
            (0, Err(err)) => {
                self.primary_rejected = true;
                let aggregate = self.rejections.record(0, err);
                match self.fallback.take() {
                    Some(value) => Some(Ok(value)),
                    None => aggregate.map(|aggregate| Err(aggregate.into())),
                }
            }
            (_, Ok(value)) if self.primary_rejected => Some(Ok(value)),
            (_, Ok(value)) => {
                if self.fallback.is_none() {
                    self.fallback = Some(value);
                }
                None
            }
            (_, Err(err)) => self
                .rejections
                .record(index, err)
                .map(|aggregate| Err(aggregate.into())),
        }
    }
}
