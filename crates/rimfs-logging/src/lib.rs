//! Logging setup for the chunkserver.
//!
//! The engine runs on named native threads (`hdd-tester`, `hdd-folders`,
//! `hdd-scan`, `hdd-migrate`, ...) and tags events with structured fields
//! such as `chunk_id`, `folder` and `part_type`, so the subscriber shows
//! thread names by default and keeps events on one line. Output goes to
//! stderr and, when a directory is configured, to a daily rolling
//! `chunkserver.log` written through a non-blocking background writer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level (trace, debug, info, warn, error).
    pub level: String,

    /// Extra per-target directives, e.g. `"rimfs_chunk_engine::scan=warn"`
    /// to quiet per-percent scan progress on folders with many chunks.
    pub directives: Vec<String>,

    /// Directory for the daily rolling `chunkserver.log`; stderr-only when
    /// unset.
    pub log_dir: Option<PathBuf>,

    /// Emit JSON events instead of the human-readable format.
    pub json: bool,

    /// Show the emitting thread's name. The engine names every long-lived
    /// thread, so this is on by default.
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directives: Vec::new(),
            log_dir: None,
            json: false,
            thread_names: true,
        }
    }
}

/// Keeps the non-blocking file writer alive; dropping it flushes pending
/// events and stops the writer thread.
pub struct LogGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Install the global subscriber. Call once at startup, before the engine
/// spawns its threads. `RUST_LOG` overrides the configured default level but
/// the configured per-target directives still apply on top.
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    for directive in &config.directives {
        match directive.parse() {
            Ok(parsed) => filter = filter.add_directive(parsed),
            Err(e) => eprintln!("ignoring log directive {:?}: {}", directive, e),
        }
    }

    let stderr_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_thread_names(config.thread_names),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(config.thread_names),
        )
    };

    let (file_layer, file_guard): (
        Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>>,
        Option<WorkerGuard>,
    ) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chunkserver.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
                Box::new(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_thread_names(config.thread_names),
                )
            } else {
                Box::new(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_thread_names(config.thread_names),
                )
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_writer: file_guard,
    }
}
