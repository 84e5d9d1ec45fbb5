use std::time::Duration;

use thiserror::Error;

/// The reason why a [`MemoizingCache`](crate::MemoizingCache) lookup did not yield a value.
///
/// None of these are ever cached. All callers waiting on the same computation receive a clone
/// of the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError<E> {
    /// The producer itself failed.
    ///
    /// The attached error is exactly what the producer returned.
    #[error("{0}")]
    Producer(E),
    /// The producer did not finish within the configured compute timeout.
    #[error("computation timed out after {0:?}")]
    Timeout(Duration),
    /// The producer panicked.
    #[error("computation panicked")]
    Panicked,
}

impl<E> CacheError<E> {
    /// Returns the producer's error, if this is a [`Producer`](Self::Producer) failure.
    pub fn producer_error(&self) -> Option<&E> {
        match self {
            Self::Producer(err) => Some(err),
            _ => None,
        }
    }

    /// Converts into the producer's error, if this is a [`Producer`](Self::Producer) failure.
    pub fn into_producer_error(self) -> Option<E> {
        match self {
            Self::Producer(err) => Some(err),
            _ => None,
        }
    }

    /// A short, stable name for this kind of failure, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Producer(_) => "producer",
            Self::Timeout(_) => "timeout",
            Self::Panicked => "panic",
        }
    }
}
