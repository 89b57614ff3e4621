//! Logging setup for microperf binaries.
//!
//! ```rust,ignore
//! let _session = microperf_tracing::subscriber()
//!     .env_filter("microperf=debug")
//!     .log_file("perf.log")
//!     .init()?;
//! ```

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither an explicit filter nor `RUST_LOG` is set
pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Default)]
pub struct LogOptions {
    log_file: Option<PathBuf>,
    pub env_filter: Option<String>,
}

/// This is a convenience tracing subscriber with some opinionated defaults.
pub fn subscriber() -> LogOptions {
    LogOptions::default()
}

impl LogOptions {
    /// Mirror all log lines into a file (written off-thread)
    pub fn log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn env_filter(mut self, env_filter: impl ToString) -> Self {
        self.env_filter = Some(env_filter.to_string());
        self
    }

    fn build_filter(&self) -> anyhow::Result<EnvFilter> {
        match &self.env_filter {
            Some(f) => EnvFilter::builder()
                .parse(f)
                .with_context(|| format!("invalid tracing filter `{f}`")),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }

    /// Install as the global tracing subscriber
    pub fn init(self) -> anyhow::Result<LogSession> {
        let filter = self.build_filter()?;
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));

        if let Some(path) = self.log_file {
            let file = File::create(&path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .context("a global tracing subscriber is already installed")?;
            Ok(LogSession {
                _guard: Some(guard),
                log_path: Some(path),
            })
        } else {
            registry
                .try_init()
                .context("a global tracing subscriber is already installed")?;
            Ok(LogSession {
                _guard: None,
                log_path: None,
            })
        }
    }
}

/// Keeps the background log writer alive; drop it last to flush the file
pub struct LogSession {
    _guard: Option<WorkerGuard>,
    pub log_path: Option<PathBuf>,
}
