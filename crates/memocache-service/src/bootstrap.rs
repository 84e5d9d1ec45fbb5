//! Process-wide setup of error reporting, logging and metrics.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use sentry::ClientInitGuard;
use tokio::task::JoinHandle;

use crate::config::{Config, Metrics};
use crate::identity::IdentityProvider;
use crate::logging;
use crate::service::InsightsService;

/// Initializes Sentry, logging and metrics from `config`.
///
/// The returned guard flushes pending Sentry events when dropped, so keep it alive for the
/// lifetime of the process.
///
/// # Safety
/// This calls [`logging::init_logging`], so the same restrictions apply: it must be called while
/// the process is still single-threaded.
pub unsafe fn init(config: &Config) -> Result<ClientInitGuard> {
    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        session_mode: sentry::SessionMode::Request,
        auto_session_tracking: false,
        ..Default::default()
    });

    // SAFETY: Forwarded to our caller.
    unsafe { logging::init_logging(config) };

    init_metrics(&config.metrics)?;

    Ok(sentry)
}

/// Starts reporting to statsd, if a statsd server is configured.
pub fn init_metrics(config: &Metrics) -> Result<()> {
    let Some(ref statsd) = config.statsd else {
        return Ok(());
    };

    memocache::metrics::configure_statsd(&config.prefix, statsd, global_tags(config))
        .with_context(|| format!("failed to set up metrics reporting to {statsd}"))
}

/// Creates the shared [`InsightsService`] and starts its purge task, if one is configured.
///
/// Must be called from within a `tokio` runtime.
pub fn start_service(
    config: &Config,
    identities: Arc<dyn IdentityProvider>,
) -> Result<(InsightsService, Option<JoinHandle<()>>)> {
    let service = InsightsService::from_config(config, identities)?;
    let purge = config
        .caches
        .purge_interval
        .map(|interval| service.spawn_purge(interval));

    tracing::info!(
        backend = %config.backend.url,
        purge_interval = ?config.caches.purge_interval,
        "Started resource cache"
    );
    Ok((service, purge))
}

fn global_tags(config: &Metrics) -> BTreeMap<String, String> {
    let mut tags = config.custom_tags.clone();

    let hostname = config.hostname_tag.clone().and_then(|tag| {
        hostname::get()
            .ok()
            .and_then(|s| s.into_string().ok())
            .map(|name| (tag, name))
    });
    tags.extend(hostname);

    tags
}
