use std::path::PathBuf;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

pub const LOG_FILE: &str = "chatflow.log";
pub const EVENT_FILE: &str = "chatflow.events.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `info` or `chatflow=debug,reqwest=warn`.
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", None)
    }
}

fn env_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive).with_context(|| format!("invalid log level `{directive}`"))
}

/// Installs the global subscriber.
///
/// Human-readable output goes to stderr; stdout belongs to the outbound
/// command stream. With a log directory, a daily rolling text log and a
/// JSON event log are written there as well. Keep the returned guards alive
/// until shutdown or the file writers lose their tail.
pub fn init_tracing(config: &LogConfig) -> Result<Vec<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter(&config.log_level)?);

    let mut guards = Vec::new();
    let file_layers = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log dir {}", dir.display()))?;

            let (txt_writer, txt_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE));
            let (json_writer, json_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, EVENT_FILE));
            guards.push(txt_guard);
            guards.push(json_guard);

            let txt_layer = fmt::layer()
                .with_writer(txt_writer)
                .with_ansi(false)
                .with_filter(env_filter(&config.log_level)?);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_current_span(true)
                .with_filter(env_filter(&config.log_level)?);
            Some(txt_layer.and_then(json_layer))
        }
        None => None,
    };

    Registry::default()
        .with(stderr_layer)
        .with(file_layers)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(guards)
}
