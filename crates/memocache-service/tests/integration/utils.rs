use std::sync::Arc;
use std::time::Duration;

use memocache_service::backend::HttpBackend;
use memocache_service::config::{BackendConfig, CacheConfigs};
use memocache_service::identity::{SessionToken, StaticIdentities};
use memocache_service::service::InsightsService;
use memocache_test::BackendServer;

/// Every session in [`identities`] is named after its user, with a `-session` suffix.
pub const USERS: &[&str] = &["u1", "u2", "slow", "missing", "fail1", "garbage"];

pub fn session(user: &str) -> SessionToken {
    SessionToken::new(format!("{user}-session"))
}

pub fn identities() -> StaticIdentities {
    USERS.iter().fold(StaticIdentities::new(), |identities, user| {
        identities.with_session(format!("{user}-session"), *user)
    })
}

pub fn backend_config(server: &BackendServer) -> BackendConfig {
    BackendConfig {
        url: server.url("/"),
        connect_timeout: Duration::from_secs(1),
        timeout: Duration::from_secs(5),
    }
}

pub fn setup_service(
    server: &BackendServer,
    update_config: impl FnOnce(&mut CacheConfigs),
) -> InsightsService {
    memocache_test::setup();

    let mut config = CacheConfigs::default();
    update_config(&mut config);

    let backend = HttpBackend::new(&backend_config(server)).unwrap();
    InsightsService::new(&config, Arc::new(backend), Arc::new(identities()))
}
