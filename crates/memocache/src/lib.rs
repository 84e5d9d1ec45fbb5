//! An in-memory memoizing cache for async computations.
//!
//! The [`MemoizingCache`] maps keys to lazily computed values. It does request coalescing, so
//! concurrent lookups of the same missing key share a single computation, and it keeps computed
//! values around for a TTL chosen by whoever triggered the computation.
//!
//! Failed computations are never cached. Every caller waiting on a failed computation observes
//! the same [`CacheError`], and the next lookup starts a fresh computation.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod error;
mod memory;

pub use error::*;
pub use memory::*;

#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;
