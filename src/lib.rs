//! Chainable, thread-safe promises.
//!
//! A [`Promise`] is the eventual result of a unit of work submitted to an
//! [`Executor`](executor::Executor). Promises settle exactly once, chain with
//! `then`/`catch`/`finally`, follow nested promises to their final outcome,
//! and combine through [`Promise::all`], [`Promise::all_settled`],
//! [`Promise::race`], [`Promise::any`] and [`Promise::first_priority`].
//! Lazy and retryable promises keep the work body around so it can start on
//! the first subscription or run again after a rejection.
//!
//! # Examples
//!
//! ```
//! use promise_kit::{Error, Promise};
//! use futures::executor::block_on;
//!
//! let p = Promise::new(|c| c.fulfill(2))
//!     .then(|x| Ok(x * 10))
//!     .then(|x| if x > 10 { Err(Error::msg("too big")) } else { Ok(x) })
//!     .catch(|_| Ok(0));
//! assert_eq!(block_on(p.wait()).unwrap(), 0);
//! ```

mod cell;
mod combinators;
mod deferred;
mod error;
pub mod executor;
mod promise;

pub use cell::{IntoResolution, PromiseState, Resolution};
pub use combinators::PromiseResult;
pub use deferred::Phase;
pub use error::{AggregateError, Error};
pub use promise::{Continuation, Promise, Wait};
