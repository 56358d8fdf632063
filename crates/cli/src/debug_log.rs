//! Session log for vsync
//!
//! Every invocation writes a full trace to `vsync-<uuid>.log` in the system
//! temp directory. The console only shows warnings, or debug output with
//! `--verbose`.

use std::path::PathBuf;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

use crate::progress::ProgressWriter;

/// Keeps the non-blocking file writer flushing until dropped.
pub struct LogSession {
    pub path: PathBuf,
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

pub fn init(verbose: bool) -> LogSession {
    let dir = std::env::temp_dir();
    let name = format!("vsync-{}.log", uuid::Uuid::new_v4());
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &name));

    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    let console = tracing_subscriber::fmt::layer()
        .with_writer(ProgressWriter)
        .with_target(false)
        .with_filter(if verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::WARN
        });

    // RUST_LOG overrides what reaches either layer
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,vsync=trace,vsync_core=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file)
        .with(console)
        .init();

    LogSession {
        path: dir.join(name),
        _guard: guard,
    }
}
