//! Memoized access to per-user resources computed by a backend service.
//!
//! The [`InsightsService`](service::InsightsService) resolves the caller's session to a user,
//! and serves insights, predictions and recommendations for that user out of a single
//! [`MemoizingCache`](memocache::MemoizingCache). Concurrent requests for the same resource
//! result in one backend request.

pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod identity;
pub mod keys;
pub mod logging;
pub mod service;
