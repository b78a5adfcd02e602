//! Process-wide `tracing` setup.
//!
//! The interactive client owns stderr for drawing, so it logs to a file; `serve` logs to
//! stderr with colours. `SHELL_BRIDGE_LOG_FILTER` replaces the level-derived directives
//! entirely.

use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const FILTER_ENV: &str = "SHELL_BRIDGE_LOG_FILTER";
/// Set to a non-zero value to keep socket and HTTP crates at `trace` too.
pub const TRACE_DEPS_ENV: &str = "SHELL_BRIDGE_TRACE_DEPS";

/// Crates that flood a trace log with per-frame noise.
const NOISY_DEPENDENCIES: &[&str] = &["tungstenite", "tokio_tungstenite", "hyper", "axum", "mio"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Base `EnvFilter` directives; debug raises only this crate's targets.
    fn directives(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "info,shell_bridge=debug",
            LogLevel::Trace => "trace",
        }
    }

    fn verbose(self) -> bool {
        matches!(self, LogLevel::Debug | LogLevel::Trace)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot open log file {path:?}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot install log subscriber: {0}")]
    Install(String),
}

/// Environment overrides, read once per `init`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct FilterOverrides {
    filter: Option<String>,
    trace_dependencies: bool,
}

impl FilterOverrides {
    fn from_env() -> Self {
        let filter = std::env::var(FILTER_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        let trace_dependencies = std::env::var(TRACE_DEPS_ENV)
            .map(|value| !value.is_empty() && value != "0")
            .unwrap_or(false);
        Self {
            filter,
            trace_dependencies,
        }
    }
}

fn filter_for(level: LogLevel, overrides: &FilterOverrides) -> String {
    if let Some(filter) = &overrides.filter {
        return filter.clone();
    }
    let mut filter = level.directives().to_owned();
    if level == LogLevel::Trace && !overrides.trace_dependencies {
        for target in NOISY_DEPENDENCIES {
            filter.push_str(&format!(",{target}=info"));
        }
    }
    filter
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber once; later calls return `Ok` without changing it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let filter = filter_for(config.level, &FilterOverrides::from_env());

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&filter))
        .with_target(config.level.verbose())
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(target = "telemetry", %filter, file = ?config.file, "logging ready");
    Ok(())
}
