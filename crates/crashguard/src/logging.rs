use std::env;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, Logging};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             crashguard=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             crashguard=TRACE"
        }
    }
}

/// Initializes logging for the crash handler.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration.
///
/// The crash handler lives inside a host process that may have set up its own `tracing`
/// subscriber already. In that case the existing subscriber is kept and this is a no-op.
pub fn init_logging(config: &Logging) {
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level).to_string());

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let fmt_layer = match (config.format, console::user_attended_stderr()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    }
    .with_filter(EnvFilter::new(&rust_log));

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("keeping the host's log subscriber");
    }
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
