use std::time::Duration;

use memocache_service::backend::{Backend, BackendError, HttpBackend, Payload};
use memocache_service::config::BackendConfig;
use memocache_service::identity::UserId;
use memocache_service::keys::ResourceKind;
use memocache_test::BackendServer;

use crate::utils::backend_config;

async fn fetch_insights(backend: &HttpBackend, user: &str) -> Result<Payload, BackendError> {
    backend
        .fetch(ResourceKind::Insights, &UserId::new(user))
        .await
}

#[tokio::test]
async fn test_fetch_resource() {
    memocache_test::setup();
    let server = BackendServer::new();
    let backend = HttpBackend::new(&backend_config(&server)).unwrap();

    let payload = backend
        .fetch(ResourceKind::Recommendations, &UserId::new("u1"))
        .await
        .unwrap();

    assert_eq!(payload["kind"], "recommendations");
    assert_eq!(payload["user"], "u1");
    assert_eq!(server.hits("/recommendations/u1"), 1);
}

#[tokio::test]
async fn test_fetch_errors() {
    memocache_test::setup();
    let server = BackendServer::new();
    let backend = HttpBackend::new(&backend_config(&server)).unwrap();

    assert_eq!(
        fetch_insights(&backend, "missing").await,
        Err(BackendError::NotFound)
    );
    assert_eq!(
        fetch_insights(&backend, "fail1").await,
        Err(BackendError::Status {
            status: 500,
            details: "backend exploded".into()
        })
    );
    assert!(matches!(
        fetch_insights(&backend, "garbage").await,
        Err(BackendError::Malformed(_))
    ));
    assert_eq!(server.accesses(), 3);
}

#[tokio::test]
async fn test_request_timeout() {
    memocache_test::setup();
    let server = BackendServer::new();
    let config = BackendConfig {
        timeout: Duration::from_millis(50),
        ..backend_config(&server)
    };
    let backend = HttpBackend::new(&config).unwrap();

    let result = backend
        .fetch(ResourceKind::Insights, &UserId::new("slow"))
        .await;
    assert_eq!(result, Err(BackendError::Timeout(Duration::from_millis(50))));
}

#[tokio::test]
async fn test_unreachable_backend() {
    memocache_test::setup();
    let url = {
        let server = BackendServer::new();
        server.url("/")
    };
    // Give the aborted server task a chance to release its socket.
    tokio::task::yield_now().await;

    let config = BackendConfig {
        url,
        connect_timeout: Duration::from_millis(500),
        timeout: Duration::from_secs(1),
    };
    let backend = HttpBackend::new(&config).unwrap();

    let result = backend
        .fetch(ResourceKind::Insights, &UserId::new("u1"))
        .await;
    assert!(result.is_err());
}
