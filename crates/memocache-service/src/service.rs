use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use memocache::{CacheError, MemoizingCache};
use reqwest::StatusCode;
use sentry::{Hub, SentryFutureExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::{Backend, BackendError, HttpBackend, Payload};
use crate::config::{CacheConfigs, Config};
use crate::identity::{IdentityProvider, SessionToken};
use crate::keys::{CacheKey, ResourceKind, TtlTiers};

/// The in-memory cache of backend resources.
pub type ResourceCache = MemoizingCache<CacheKey, Payload, BackendError>;

/// The reason why a resource could not be served.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The session does not belong to anyone. The cache was not consulted.
    #[error("unauthorized")]
    Unauthorized,
    /// Computing the resource failed.
    #[error(transparent)]
    Cache(#[from] CacheError<BackendError>),
}

impl ServiceError {
    /// The HTTP status code this error should be surfaced as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Cache(CacheError::Producer(BackendError::NotFound)) => StatusCode::NOT_FOUND,
            Self::Cache(CacheError::Producer(BackendError::Timeout(_)))
            | Self::Cache(CacheError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cache(CacheError::Producer(_)) => StatusCode::BAD_GATEWAY,
            Self::Cache(CacheError::Panicked) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Serves per-user resources from the backend, memoized in a single shared cache.
///
/// Callers are identified first, and only authenticated callers ever reach the cache. Cached
/// values are keyed by `<kind>:<user>` and kept for the TTL tier of their kind.
#[derive(Clone, Debug)]
pub struct InsightsService {
    cache: ResourceCache,
    backend: Arc<dyn Backend>,
    identities: Arc<dyn IdentityProvider>,
    ttl: TtlTiers,
}

impl InsightsService {
    pub fn new(
        config: &CacheConfigs,
        backend: Arc<dyn Backend>,
        identities: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            cache: MemoizingCache::with_compute_timeout("resources", config.compute_timeout),
            backend,
            identities,
            ttl: config.ttl,
        }
    }

    /// Creates the service with an [`HttpBackend`] as configured in `config`.
    pub fn from_config(config: &Config, identities: Arc<dyn IdentityProvider>) -> Result<Self> {
        let backend =
            HttpBackend::new(&config.backend).context("failed to create backend client")?;
        Ok(Self::new(&config.caches, Arc::new(backend), identities))
    }

    /// The cache backing this service.
    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Returns the resource of the given `kind` for the owner of `session`.
    pub async fn get(
        &self,
        session: &SessionToken,
        kind: ResourceKind,
    ) -> Result<Payload, ServiceError> {
        let Some(user) = self.identities.identify(session).await else {
            tracing::debug!("Rejecting unauthenticated request for {}", kind);
            return Err(ServiceError::Unauthorized);
        };

        let key = CacheKey::new(kind, &user);
        let ttl = self.ttl.ttl(kind.ttl_tier());
        let backend = Arc::clone(&self.backend);

        let payload = self
            .cache
            .get_or_set(
                key,
                move || async move { backend.fetch(kind, &user).await },
                ttl,
            )
            .await
            .inspect_err(|err| {
                tracing::warn!(error = %err, "Failed to compute {}", kind);
            })?;

        Ok(payload)
    }

    /// Drops the cached resource of the given `kind` for the owner of `session`.
    pub async fn invalidate(
        &self,
        session: &SessionToken,
        kind: ResourceKind,
    ) -> Result<(), ServiceError> {
        let user = self
            .identities
            .identify(session)
            .await
            .ok_or(ServiceError::Unauthorized)?;

        self.cache.invalidate(&CacheKey::new(kind, &user));
        Ok(())
    }

    /// Spawns a task that purges expired entries every `interval`.
    ///
    /// The task runs until it is aborted through the returned handle.
    pub fn spawn_purge(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.cache.clone();

        let task = async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.purge_expired();
            }
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::future::join_all;
    use tokio::time;

    use super::*;
    use crate::identity::{StaticIdentities, UserId};

    #[derive(Debug, Default)]
    struct FakeBackend {
        calls: AtomicUsize,
        missing: bool,
    }

    impl FakeBackend {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn fetch(&self, kind: ResourceKind, user: &UserId) -> Result<Payload, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            time::sleep(Duration::from_millis(10)).await;
            if self.missing {
                return Err(BackendError::NotFound);
            }
            Ok(Arc::new(serde_json::json!({
                "kind": kind,
                "user": user.as_str(),
                "call": call,
            })))
        }
    }

    fn service(backend: &Arc<FakeBackend>, config: &CacheConfigs) -> InsightsService {
        let identities = StaticIdentities::new()
            .with_session("alice-session", "alice")
            .with_session("bob-session", "bob");
        InsightsService::new(config, backend.clone(), Arc::new(identities))
    }

    fn alice() -> SessionToken {
        SessionToken::new("alice-session")
    }

    #[tokio::test]
    async fn test_unauthorized_skips_backend() {
        let backend = Arc::new(FakeBackend::default());
        let service = service(&backend, &CacheConfigs::default());

        let result = service
            .get(&SessionToken::new("stolen"), ResourceKind::Insights)
            .await;
        assert_eq!(result, Err(ServiceError::Unauthorized));
        assert_eq!(backend.calls(), 0);
        assert_eq!(service.cache().entry_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_coalesced() {
        time::pause();
        let backend = Arc::new(FakeBackend::default());
        let service = service(&backend, &CacheConfigs::default());
        let session = alice();

        let requests = (0..5).map(|_| service.get(&session, ResourceKind::Insights));
        let results = join_all(requests).await;

        assert_eq!(backend.calls(), 1);
        for result in results {
            let payload = result.unwrap();
            assert_eq!(payload["user"], "alice");
            assert_eq!(payload["call"], 1);
        }
    }

    #[tokio::test]
    async fn test_users_and_kinds_are_separate() {
        time::pause();
        let backend = Arc::new(FakeBackend::default());
        let service = service(&backend, &CacheConfigs::default());

        let alice_insights = service.get(&alice(), ResourceKind::Insights).await.unwrap();
        let bob_insights = service
            .get(&SessionToken::new("bob-session"), ResourceKind::Insights)
            .await
            .unwrap();
        let alice_predictions = service
            .get(&alice(), ResourceKind::Predictions)
            .await
            .unwrap();

        assert_eq!(backend.calls(), 3);
        assert_eq!(alice_insights["user"], "alice");
        assert_eq!(bob_insights["user"], "bob");
        assert_eq!(alice_predictions["kind"], "predictions");
    }

    #[tokio::test]
    async fn test_ttl_tiers_per_kind() {
        time::pause();
        let backend = Arc::new(FakeBackend::default());
        let service = service(&backend, &CacheConfigs::default());

        service.get(&alice(), ResourceKind::Predictions).await.unwrap();
        service
            .get(&alice(), ResourceKind::Recommendations)
            .await
            .unwrap();
        assert_eq!(backend.calls(), 2);

        // Past the medium tier, but well within the long one.
        time::advance(Duration::from_secs(16 * 60)).await;

        let predictions = service.get(&alice(), ResourceKind::Predictions).await.unwrap();
        let recommendations = service
            .get(&alice(), ResourceKind::Recommendations)
            .await
            .unwrap();
        assert_eq!(backend.calls(), 3);
        assert_eq!(predictions["call"], 3);
        assert_eq!(recommendations["call"], 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        time::pause();
        let backend = Arc::new(FakeBackend {
            missing: true,
            ..Default::default()
        });
        let service = service(&backend, &CacheConfigs::default());

        for _ in 0..2 {
            let error = service
                .get(&alice(), ResourceKind::Insights)
                .await
                .unwrap_err();
            assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
        }
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        time::pause();
        let backend = Arc::new(FakeBackend::default());
        let service = service(&backend, &CacheConfigs::default());

        service.get(&alice(), ResourceKind::Insights).await.unwrap();
        service
            .invalidate(&alice(), ResourceKind::Insights)
            .await
            .unwrap();
        let payload = service.get(&alice(), ResourceKind::Insights).await.unwrap();

        assert_eq!(payload["call"], 2);
        assert_eq!(
            service
                .invalidate(&SessionToken::new("stolen"), ResourceKind::Insights)
                .await,
            Err(ServiceError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn test_purge_task() {
        time::pause();
        let backend = Arc::new(FakeBackend::default());
        let service = service(&backend, &CacheConfigs::default());

        let key = CacheKey::new(ResourceKind::Insights, &UserId::new("alice"));
        service
            .cache()
            .insert(key, Arc::new(serde_json::Value::Null), Duration::from_secs(30));

        let purge = service.spawn_purge(Duration::from_secs(60));
        time::advance(Duration::from_secs(61)).await;
        for _ in 0..10 {
            if service.cache().entry_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(service.cache().entry_count(), 0);
        purge.abort();
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ServiceError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                CacheError::Producer(BackendError::NotFound).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                CacheError::Producer(BackendError::Request("connection refused".into())).into(),
                StatusCode::BAD_GATEWAY,
            ),
            (
                CacheError::Timeout(Duration::from_secs(1)).into(),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (CacheError::Panicked.into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(error.status_code(), status, "{error}");
        }
    }
}
