use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The rejection reason carried by a promise.
///
/// Errors are cheap to clone because a single rejection is handed to every
/// subscriber of the promise that produced it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// An application supplied error, passed through untouched.
    #[error("{0}")]
    Custom(Arc<dyn StdError + Send + Sync>),
    /// Every input of `any` or `first_priority` rejected.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    /// A work body or handler panicked.
    #[error("promise handler panicked: {0}")]
    Panicked(String),
    /// A promise was resolved with itself.
    #[error("promise was resolved with itself")]
    ChainCycle,
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),
    #[error("the default queue has already been installed")]
    DefaultQueueInstalled,
}

#[derive(Error, Debug)]
#[error("{0}")]
struct Message(String);

impl Error {
    /// Wraps an application error.
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Custom(Arc::new(err))
    }

    /// Builds an application error from a plain message.
    ///
    /// ```
    /// use promise_kit::Error;
    /// let err = Error::msg("boom");
    /// assert_eq!(err.to_string(), "boom");
    /// ```
    pub fn msg(message: impl fmt::Display) -> Self {
        Error::Custom(Arc::new(Message(message.to_string())))
    }

    /// Returns the wrapped application error if it is of type `E`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Error::Custom(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn as_aggregate(&self) -> Option<&AggregateError> {
        match self {
            Error::Aggregate(aggregate) => Some(aggregate),
            _ => None,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Error::Panicked(message)
    }
}

/// Every component failure of a combinator whose inputs all rejected, in
/// input order.
#[derive(Debug, Clone, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    pub fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} promises were rejected", self.errors.len())?;
        for (index, err) in self.errors.iter().enumerate() {
            write!(f, "; [{index}] {err}")?;
        }
        Ok(())
    }
}

impl StdError for AggregateError {}
