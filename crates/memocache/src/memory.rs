use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::CacheError;
use crate::time::Instant;

/// A computation that any number of callers can await, resolving to the same result for all.
type Computation<V, E> = Shared<BoxFuture<'static, Result<V, CacheError<E>>>>;

/// Resolves a [`Computation`] with the outcome of its producer.
type Sender<V, E> = oneshot::Sender<Result<V, CacheError<E>>>;

/// A computed value held in memory.
#[derive(Clone, Debug)]
struct ReadyItem<V> {
    /// When to treat this item as absent.
    ///
    /// `None` if `now + ttl` was not representable, which means the item never expires.
    deadline: Option<Instant>,
    /// The actual data.
    value: V,
}

impl<V> ReadyItem<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| now < deadline)
    }
}

/// A slot in the entry table.
///
/// A key without a slot is empty. Failed computations remove their slot, they never turn it into
/// a `Ready` one.
enum Slot<V, E> {
    /// A producer is running. Every caller for this key awaits `computation`.
    ///
    /// The `generation` identifies the computation, so that a computation whose slot was
    /// invalidated or replaced in the meantime does not write its result.
    Pending {
        generation: u64,
        computation: Computation<V, E>,
    },
    Ready(ReadyItem<V>),
}

/// What a lookup has to do next.
enum Lookup<V, E> {
    /// A fresh value was found.
    Hit(V),
    /// An earlier caller is computing the value.
    Wait(Computation<V, E>),
    /// This caller registered a new pending computation and has to start it.
    Start {
        generation: u64,
        sender: Sender<V, E>,
        computation: Computation<V, E>,
    },
}

struct CacheInner<K, V, E> {
    name: String,
    compute_timeout: Option<Duration>,
    entries: Mutex<HashMap<K, Slot<V, E>>>,
    next_generation: AtomicU64,
}

impl<K, V, E> CacheInner<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    fn entries(&self) -> MutexGuard<'_, HashMap<K, Slot<V, E>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the outcome of computation `generation` for `key`.
    ///
    /// Successful values become `Ready` with a deadline of `now + ttl`, failures clear the slot.
    /// Nothing happens if the slot no longer belongs to this computation.
    fn complete(&self, key: &K, generation: u64, result: &Result<V, CacheError<E>>, ttl: Duration) {
        let mut entries = self.entries();

        let owns_slot = matches!(
            entries.get(key),
            Some(Slot::Pending { generation: current, .. }) if *current == generation
        );
        if !owns_slot {
            tracing::trace!(
                cache = %self.name,
                ?key,
                "Discarding result of a computation that was invalidated"
            );
            return;
        }

        match result {
            Ok(value) => {
                let item = ReadyItem {
                    deadline: Instant::now().checked_add(ttl),
                    value: value.clone(),
                };
                entries.insert(key.clone(), Slot::Ready(item));
            }
            Err(_) => {
                entries.remove(key);
            }
        }
    }
}

/// An in-memory cache that memoizes async computations per key.
///
/// Lookups go through [`get_or_set`](Self::get_or_set):
///
/// - A fresh value is returned right away, without invoking the producer.
/// - If another caller is already computing the value, the lookup waits for that computation and
///   returns its result. Concurrent lookups for the same missing key thus run the producer only
///   once.
/// - Otherwise the producer is invoked, and a successful result is kept for the `ttl` given by
///   this call.
///
/// Lookups for different keys never wait on each other. The entry table lock is only held for
/// short map operations and never while a producer runs. Computations are spawned as `tokio`
/// tasks, so they finish even if all of their callers are dropped.
///
/// The cache is a cheap handle around shared state, clones all refer to the same entries.
pub struct MemoizingCache<K, V, E> {
    inner: Arc<CacheInner<K, V, E>>,
}

impl<K, V, E> Clone for MemoizingCache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for MemoizingCache<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ready, pending) = self
            .inner
            .entries
            .try_lock()
            .map(|entries| {
                let pending = entries
                    .values()
                    .filter(|slot| matches!(slot, Slot::Pending { .. }))
                    .count();
                (entries.len() - pending, pending)
            })
            .unwrap_or_default();
        f.debug_struct("MemoizingCache")
            .field("name", &self.inner.name)
            .field("compute_timeout", &self.inner.compute_timeout)
            .field("ready entries", &ready)
            .field("running computations", &pending)
            .finish()
    }
}

impl<K, V, E> MemoizingCache<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a new cache without a compute timeout.
    ///
    /// The `name` is used to tag metrics and logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_compute_timeout(name, None)
    }

    /// Creates a new cache that fails computations running longer than `compute_timeout`.
    pub fn with_compute_timeout(name: impl Into<String>, compute_timeout: Option<Duration>) -> Self {
        let inner = CacheInner {
            name: name.into(),
            compute_timeout,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the value for `key`, computing it with `producer` if necessary.
    ///
    /// `producer` is only called if no fresh value exists and no computation is already running
    /// for `key`. The future it returns is spawned onto the `tokio` runtime, so it runs to
    /// completion and fills the cache even if every caller stops waiting for it. This must be
    /// called from within a `tokio` runtime.
    ///
    /// A successful result is kept for `ttl`, counted from the moment the computation finished.
    /// If several callers wait on one computation, the `ttl` of the caller that started it is
    /// used.
    ///
    /// # Errors
    ///
    /// Fails with the producer's error, or with [`CacheError::Timeout`] /
    /// [`CacheError::Panicked`]. Failures are not cached. All callers waiting on the same
    /// computation receive the same error.
    pub async fn get_or_set<F, Fut>(
        &self,
        key: K,
        producer: F,
        ttl: Duration,
    ) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        metric!(counter("caches.access") += 1, "cache" => self.name());

        match self.lookup_or_register(&key) {
            Lookup::Hit(value) => Ok(value),
            Lookup::Wait(computation) => computation.await,
            Lookup::Start {
                generation,
                sender,
                computation,
            } => {
                self.start(key, generation, sender, producer, ttl);
                computation.await
            }
        }
    }

    /// Returns a fresh value for `key` without computing anything.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.inner.entries().get(key) {
            Some(Slot::Ready(item)) if item.is_fresh(Instant::now()) => Some(item.value.clone()),
            _ => None,
        }
    }

    /// Stores `value` for `key`, replacing whatever was there.
    ///
    /// If a computation is running for `key`, its callers still receive its result, but that
    /// result does not replace `value`.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let item = ReadyItem {
            deadline: Instant::now().checked_add(ttl),
            value,
        };
        self.inner.entries().insert(key, Slot::Ready(item));
    }

    /// Removes the entry for `key`, regardless of its state.
    ///
    /// Callers already waiting on a running computation still receive its result. That result
    /// is not stored, so the next lookup starts a new computation.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.inner.entries().remove(key).is_some() {
            metric!(counter("caches.invalidate") += 1, "cache" => self.name());
        }
    }

    /// Removes all entries.
    pub fn invalidate_all(&self) {
        let removed = {
            let mut entries = self.inner.entries();
            let removed = entries.len();
            entries.clear();
            removed
        };
        metric!(counter("caches.invalidate") += removed as i64, "cache" => self.name());
    }

    /// The number of entries, including the ones that are still being computed.
    ///
    /// Expired entries are counted until they are looked up again or purged.
    pub fn entry_count(&self) -> usize {
        self.inner.entries().len()
    }

    /// Removes all expired entries and returns how many were removed.
    ///
    /// Expired entries are never served, so this only reclaims their memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let purged = {
            let mut entries = self.inner.entries();
            let before = entries.len();
            entries.retain(|_, slot| match slot {
                Slot::Ready(item) => item.is_fresh(now),
                Slot::Pending { .. } => true,
            });
            before - entries.len()
        };

        if purged > 0 {
            tracing::debug!(cache = %self.name(), purged, "Purged expired cache entries");
        }
        metric!(counter("caches.purged") += purged as i64, "cache" => self.name());
        purged
    }

    /// Looks up `key` and, on a miss, registers a pending computation for it.
    ///
    /// Checking for an entry and registering happens under a single lock, so there can only ever
    /// be one computation per key. The caller that gets [`Lookup::Start`] must start it.
    fn lookup_or_register(&self, key: &K) -> Lookup<V, E> {
        let name = self.name();
        let mut entries = self.inner.entries();

        match entries.get(key) {
            Some(Slot::Ready(item)) if item.is_fresh(Instant::now()) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                return Lookup::Hit(item.value.clone());
            }
            Some(Slot::Pending { computation, .. }) => {
                metric!(counter("caches.coalesced") += 1, "cache" => name);
                return Lookup::Wait(computation.clone());
            }
            // Either missing or expired, both need a fresh computation.
            _ => {}
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        // The sender is only dropped without sending if the runtime tears down the task.
        let computation = receiver
            .map(|received| received.unwrap_or(Err(CacheError::Panicked)))
            .boxed()
            .shared();

        entries.insert(
            key.clone(),
            Slot::Pending {
                generation,
                computation: computation.clone(),
            },
        );

        Lookup::Start {
            generation,
            sender,
            computation,
        }
    }

    /// Invokes `producer` and spawns its future as the computation `generation` for `key`.
    ///
    /// The spawned task applies the compute timeout, turns panics into
    /// [`CacheError::Panicked`], writes its outcome back to the entry table, and only then
    /// resolves the waiters.
    fn start<F, Fut>(
        &self,
        key: K,
        generation: u64,
        sender: Sender<V, E>,
        producer: F,
        ttl: Duration,
    ) where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        tracing::trace!(cache = %self.name(), ?key, generation, "Spawning deduplicated computation");

        let producer = match panic::catch_unwind(AssertUnwindSafe(producer)) {
            Ok(producer) => producer,
            Err(_panic) => {
                tracing::error!(cache = %self.name(), ?key, "Cache producer panicked");
                let result: Result<V, CacheError<E>> = Err(CacheError::Panicked);
                record_failure(self.name(), &result);
                self.inner.complete(&key, generation, &result, ttl);
                sender.send(result).ok();
                return;
            }
        };

        // The task must not keep the entry table alive.
        let inner = Arc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        let compute_timeout = self.inner.compute_timeout;

        let task = async move {
            let result = run_producer(&name, &key, producer, compute_timeout).await;

            if let Some(inner) = inner.upgrade() {
                inner.complete(&key, generation, &result, ttl);
            }
            // All waiters may be gone by now, the entry table is up to date regardless.
            sender.send(result).ok();
        };

        // Bind a fresh hub, so that scope changes made by the producer do not leak into the hub
        // of the caller that started it.
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

/// Runs `producer` to completion, applying `compute_timeout` and catching panics.
async fn run_producer<K, V, E, Fut>(
    name: &str,
    key: &K,
    producer: Fut,
    compute_timeout: Option<Duration>,
) -> Result<V, CacheError<E>>
where
    K: fmt::Debug,
    Fut: Future<Output = Result<V, E>>,
{
    metric!(counter("caches.computation") += 1, "cache" => name);
    let start = Instant::now();

    let producer = AssertUnwindSafe(producer).catch_unwind();
    let outcome = match compute_timeout {
        Some(timeout) => tokio::time::timeout(timeout, producer)
            .await
            .map_err(|_| CacheError::Timeout(timeout)),
        None => Ok(producer.await),
    };

    let result = match outcome {
        Ok(Ok(result)) => result.map_err(CacheError::Producer),
        Ok(Err(_panic)) => {
            tracing::error!(cache = %name, ?key, "Cache computation panicked");
            Err(CacheError::Panicked)
        }
        Err(err) => {
            tracing::warn!(cache = %name, ?key, "Cache computation timed out");
            Err(err)
        }
    };

    metric!(timer("caches.computation.duration") = start.elapsed(), "cache" => name);
    record_failure(name, &result);
    result
}

fn record_failure<V, E>(name: &str, result: &Result<V, CacheError<E>>) {
    if let Err(err) = result {
        metric!(
            counter("caches.computation.error") += 1,
            "cache" => name,
            "reason" => err.metrics_tag(),
        );
    }
}
