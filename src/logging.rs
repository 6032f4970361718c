//! Process-wide tracing setup.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Env var consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "PIPEWRIGHT_LOG";

pub struct LogOptions<'a> {
    pub verbose: bool,
    pub json: bool,
    /// When set, a daily-rolling copy of the log is written here.
    pub file_dir: Option<&'a Path>,
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "pipewright=debug,info" } else { "info" };
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. The returned guard must be held for the
/// lifetime of the process so buffered file output is flushed.
pub fn init(options: LogOptions<'_>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = if options.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "pipewright.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(options.verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(guard)
}
