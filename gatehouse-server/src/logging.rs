//! Logging setup and dynamic level control.
//!
//! Level precedence is flag > `GATEHOUSE_LOG_LEVEL` > config > `info` (the
//! flag already folds the environment variable in via clap). SIGHUP swaps
//! the filter through the reload handle without touching the subscriber.

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Standard,
    Json,
}

impl LogFormat {
    /// Parse a format string; `None` for anything unrecognized.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "" => Some(LogFormat::Standard),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Normalize an operator-supplied level string.
///
/// Accepts the historical aliases (`notice`, `warning`, `err`) and the empty
/// string (meaning `info`); returns `None` for unknown levels so callers can
/// decide whether that is fatal (startup) or ignorable (reload).
#[must_use]
pub fn parse_level(s: &str) -> Option<&'static str> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "notice" | "info" | "" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "err" | "error" => Some("error"),
        _ => None,
    }
}

/// Pick the effective level from flag and config, with `info` as default.
///
/// # Errors
///
/// Unknown level strings are fatal at startup.
pub fn resolve_level(
    flag: Option<&str>,
    config: Option<&str>,
) -> anyhow::Result<&'static str> {
    let chosen = flag.or(config).unwrap_or("info");
    parse_level(chosen).with_context(|| format!("unknown log level {chosen:?}"))
}

/// Handle for SIGHUP-driven level changes.
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Swap the active filter to a new level.
    ///
    /// # Errors
    ///
    /// Only if the subscriber has been torn down, which does not happen in a
    /// running server.
    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        self.handle
            .reload(EnvFilter::new(level))
            .context("error updating log level")
    }
}

/// Install the global subscriber.
///
/// A second initialization (tests share one process) leaves the existing
/// subscriber in place; the returned handle is still valid for its own
/// layer.
pub fn init(level: &str, format: LogFormat) -> LogHandle {
    let (filter_layer, handle) = reload::Layer::new(EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter_layer);
    let result = match format {
        LogFormat::Standard => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("global subscriber already installed, keeping it");
    }
    LogHandle { handle }
}
