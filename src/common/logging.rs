//! Logging and tracing configuration
//!
//! One-shot runs log to stderr. Watch mode runs for a long time in a
//! terminal that is mostly showing run summaries, so it also keeps a full
//! log file.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use super::paths;

fn cli_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("uxtest=debug,warn")
        } else {
            EnvFilter::new("uxtest=info,warn")
        }
    })
}

/// Initialize tracing for one-shot CLI runs (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate (DEBUG with `--verbose`), WARN for
/// dependencies.
pub fn init_cli(verbose: bool) {
    tracing_subscriber::registry()
        .with(cli_filter(verbose))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for watch mode (file + stderr logging)
///
/// Writes a detailed log to `<data dir>/logs/watch.log` in addition to the
/// compact stderr output. The returned guard must be held for the lifetime
/// of the process so buffered lines are flushed on exit.
pub fn init_watch(verbose: bool) -> (Option<PathBuf>, Option<WorkerGuard>) {
    if let Some(log_dir) = paths::log_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let log_file = log_dir.join("watch.log");

            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
            {
                Ok(file) => {
                    let (writer, guard) = tracing_appender::non_blocking(file);

                    let file_layer = fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_span_events(FmtSpan::CLOSE);

                    let stderr_layer = fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false)
                        .compact();

                    tracing_subscriber::registry()
                        .with(cli_filter(verbose))
                        .with(file_layer)
                        .with(stderr_layer)
                        .init();

                    return (Some(log_file), Some(guard));
                }
                Err(e) => {
                    eprintln!("Warning: Could not open log file: {}", e);
                }
            }
        }
    }

    init_cli(verbose);
    (None, None)
}
