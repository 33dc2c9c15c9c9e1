use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Sets up logging to the terminal and, when given, to the run's log file.
///
/// The terminal only shows warnings unless `verbose` is set, since the tool
/// output is already shown next to the spinner. The log file always gets
/// everything from `info` up and is appended to, so retries of a run share
/// one log.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };

    let stderr_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(io::stderr)
        .with_filter(stderr_filter);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new(level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("logging is already initialised")?;

    Ok(())
}
