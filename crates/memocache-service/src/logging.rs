use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{Config, LogFormat};

/// The default filter directives for a configured log level.
///
/// Our own crates get the full level, dependencies stay at `INFO` at most.
fn default_directives(level: LevelFilter) -> String {
    let Some(level) = level.into_level() else {
        return String::new();
    };
    if level <= Level::INFO {
        return level.to_string();
    }
    format!("INFO,hyper=WARN,memocache={level},memocache_service={level}")
}

/// Forwards errors to Sentry as events and everything down to `INFO` as Sentry logs.
fn sentry_event_filter(metadata: &Metadata<'_>) -> EventFilter {
    match *metadata.level() {
        Level::ERROR => EventFilter::Event | EventFilter::Log,
        Level::WARN | Level::INFO => EventFilter::Log,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

/// The human readable console layer, or `None` if the config asks for JSON.
fn console_layer(format: LogFormat) -> Option<Box<dyn Layer<Registry> + Send + Sync>> {
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let pretty = match format {
        LogFormat::Json => return None,
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
        LogFormat::Auto => console::user_attended(),
    };

    Some(if pretty {
        layer.pretty().boxed()
    } else {
        layer.compact().with_ansi(false).boxed()
    })
}

/// Initializes logging.
///
/// `RUST_LOG` takes precedence over the configured level. With
/// [`enable_backtraces`](crate::config::Logging::enable_backtraces), this also sets
/// `RUST_BACKTRACE`.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives =
        env::var("RUST_LOG").unwrap_or_else(|_| default_directives(config.logging.level));

    let Some(console) = console_layer(config.logging.format) else {
        init_json_logging(&directives, std::io::stdout);
        return;
    };

    tracing_subscriber::registry()
        .with(console.with_filter(EnvFilter::new(&directives)))
        .with(sentry::integrations::tracing::layer().event_filter(sentry_event_filter))
        .init();
}

/// A subscriber that writes one flattened JSON object per event to `make_writer`.
pub fn json_subscriber<W>(
    directives: &str,
    make_writer: W,
) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(directives)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer().event_filter(sentry_event_filter))
}

/// Installs [`json_subscriber`] as the global subscriber.
pub fn init_json_logging<W>(directives: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    json_subscriber(directives, make_writer).init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if Level::ERROR <= LevelFilter::current() {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
