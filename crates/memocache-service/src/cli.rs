//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use memocache_service::backend::Payload;
use memocache_service::bootstrap;
use memocache_service::config::Config;
use memocache_service::identity::{SessionToken, StaticIdentities};
use memocache_service::keys::ResourceKind;

/// Memocache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a resource through the cache and print it as JSON.
    Fetch {
        /// One of `insights`, `predictions` or `recommendations`.
        kind: ResourceKind,

        /// The session to fetch for. It must be listed under `sessions` in the config.
        #[arg(long, short)]
        session: String,

        /// The number of concurrent requests to make.
        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "memocache-service", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: The runtime is only created below, so this is still single-threaded.
    let _sentry = unsafe { bootstrap::init(&config) }?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    match cli.command {
        Command::Fetch {
            kind,
            session,
            repeat,
        } => {
            let session = SessionToken::new(session);
            let payload = runtime.block_on(fetch(&config, kind, &session, repeat))?;
            println!("{}", serde_json::to_string_pretty(&*payload)?);
        }
    }

    Ok(())
}

/// Requests `kind` for `session` `repeat` times at once and returns the resource.
async fn fetch(
    config: &Config,
    kind: ResourceKind,
    session: &SessionToken,
    repeat: usize,
) -> Result<Payload> {
    let identities = StaticIdentities::from_sessions(&config.sessions);
    let (service, purge) = bootstrap::start_service(config, Arc::new(identities))?;

    let requests = (0..repeat.max(1)).map(|_| service.get(session, kind));
    let result = try_join_all(requests).await;

    if let Some(purge) = purge {
        purge.abort();
    }

    let payloads = result.with_context(|| format!("failed to fetch {kind}"))?;
    tracing::info!(cache = ?service.cache(), requests = payloads.len(), "Fetched {}", kind);

    payloads.into_iter().next().context("no request was made")
}
