use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use memocache::CacheError;
use memocache_service::bootstrap::start_service;
use memocache_service::config::Config;
use memocache_service::identity::SessionToken;
use memocache_service::keys::ResourceKind;
use memocache_service::service::ServiceError;
use memocache_test::BackendServer;
use reqwest::StatusCode;

use crate::utils::{backend_config, identities, session, setup_service};

#[tokio::test]
async fn test_concurrent_requests_hit_backend_once() {
    let server = BackendServer::new();
    let service = setup_service(&server, |_| {});
    let session = session("slow");

    let requests = (0..10).map(|_| service.get(&session, ResourceKind::Insights));
    let results = join_all(requests).await;

    for result in results {
        assert_eq!(result.unwrap()["user"], "slow");
    }
    assert_eq!(server.hits("/insights/slow"), 1);

    // Later requests are answered from memory.
    service.get(&session, ResourceKind::Insights).await.unwrap();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_resources_are_cached_per_user_and_kind() {
    let server = BackendServer::new();
    let service = setup_service(&server, |_| {});

    for _ in 0..2 {
        for user in ["u1", "u2"] {
            for kind in ResourceKind::ALL {
                let payload = service.get(&session(user), kind).await.unwrap();
                assert_eq!(payload["user"], user);
                assert_eq!(payload["kind"], kind.as_str());
            }
        }
    }

    let hits = server.all_hits();
    assert_eq!(hits.len(), 6);
    assert!(hits.iter().all(|(_, count)| *count == 1), "{hits:?}");
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let server = BackendServer::new();
    let service = setup_service(&server, |_| {});

    for user in ["fail1", "missing", "garbage"] {
        let first = service.get(&session(user), ResourceKind::Predictions).await;
        let second = service.get(&session(user), ResourceKind::Predictions).await;
        assert!(first.is_err());
        assert_eq!(first, second);
    }

    assert_eq!(
        server.all_hits(),
        vec![
            ("/predictions/fail1".to_owned(), 2),
            ("/predictions/garbage".to_owned(), 2),
            ("/predictions/missing".to_owned(), 2),
        ]
    );
}

#[tokio::test]
async fn test_status_codes() {
    let server = BackendServer::new();
    let service = setup_service(&server, |_| {});

    let status = |result: Result<_, ServiceError>| result.map(|_| ()).unwrap_err().status_code();

    let result = service.get(&session("missing"), ResourceKind::Insights).await;
    assert_eq!(status(result), StatusCode::NOT_FOUND);

    let result = service.get(&session("fail1"), ResourceKind::Insights).await;
    assert_eq!(status(result), StatusCode::BAD_GATEWAY);

    let result = service.get(&session("garbage"), ResourceKind::Insights).await;
    assert_eq!(status(result), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_unauthorized_never_reaches_backend() {
    let server = BackendServer::new();
    let service = setup_service(&server, |_| {});

    let result = service
        .get(&SessionToken::new("forged"), ResourceKind::Insights)
        .await;

    assert_eq!(result.unwrap_err().status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.accesses(), 0);
    assert_eq!(service.cache().entry_count(), 0);
}

#[tokio::test]
async fn test_compute_timeout() {
    let server = BackendServer::new();
    let service = setup_service(&server, |config| {
        config.compute_timeout = Some(Duration::from_millis(50));
    });

    let result = service.get(&session("slow"), ResourceKind::Insights).await;
    let error = result.unwrap_err();
    assert_eq!(
        error,
        ServiceError::Cache(CacheError::Timeout(Duration::from_millis(50)))
    );
    assert_eq!(error.status_code(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(service.cache().entry_count(), 0);
}

#[tokio::test]
async fn test_invalidate() {
    let server = BackendServer::new();
    let service = setup_service(&server, |_| {});

    service.get(&session("u1"), ResourceKind::Insights).await.unwrap();
    service
        .invalidate(&session("u1"), ResourceKind::Insights)
        .await
        .unwrap();
    service.get(&session("u1"), ResourceKind::Insights).await.unwrap();

    assert_eq!(server.hits("/insights/u1"), 2);
}

#[tokio::test]
async fn test_start_service_from_config() {
    memocache_test::setup();
    let server = BackendServer::new();

    let mut config = Config::default();
    config.backend = backend_config(&server);
    config.caches.purge_interval = Some(Duration::from_secs(60));

    let (service, purge) = start_service(&config, Arc::new(identities())).unwrap();
    let payload = service
        .get(&session("u2"), ResourceKind::Recommendations)
        .await
        .unwrap();
    assert_eq!(payload["user"], "u2");
    assert_eq!(server.hits("/recommendations/u2"), 1);

    let purge = purge.unwrap();
    assert!(!purge.is_finished());
    purge.abort();

    config.caches.purge_interval = None;
    let (_, purge) = start_service(&config, Arc::new(identities())).unwrap();
    assert!(purge.is_none());
}
