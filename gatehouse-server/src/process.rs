//! Process-level setup: PID file, memory locking, telemetry sink, and the
//! process-wide tunables object.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use gatehouse_core::config::{Config, TelemetryConfig};

/// Process-wide tunables, built once at startup and passed by reference.
/// Nothing mutates these after the supervisor finishes setup.
#[derive(Debug, Clone)]
pub struct RuntimeParams {
    /// Ceiling applied to inbound request handling on both planes.
    pub default_max_request_duration: Duration,
}

impl RuntimeParams {
    pub const DEFAULT_MAX_REQUEST_DURATION: Duration = Duration::from_secs(90);

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_max_request_duration: config
                .default_max_request_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(Self::DEFAULT_MAX_REQUEST_DURATION),
        }
    }
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            default_max_request_duration: Self::DEFAULT_MAX_REQUEST_DURATION,
        }
    }
}

/// Write the PID file once startup has succeeded far enough to matter.
///
/// # Errors
///
/// IO failures, with the path in context.
pub fn store_pid_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("error creating PID file directory {}", parent.display()))?;
        }
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("error storing PID at {}", path.display()))
}

/// Remove the PID file; a missing file is not an error.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove PID file");
        }
    }
}

/// Try to pin process memory so credential material never hits swap.
///
/// Failure is a warning, not an error: containers frequently lack the
/// `IPC_LOCK` capability.
pub fn lock_memory(disable: bool) {
    if disable {
        tracing::debug!("memory locking disabled by configuration");
        return;
    }
    #[cfg(unix)]
    {
        // SAFETY: mlockall takes no pointers and only affects this process.
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "mlockall(2) failed: memory may be swapped to disk; grant IPC_LOCK \
                 or set disable_mlock = true to silence this warning"
            );
        }
    }
    #[cfg(not(unix))]
    tracing::warn!("memory locking is not supported on this platform");
}

/// Start the telemetry sink described by configuration.
///
/// Metric backends are external collaborators; this records what was
/// configured and leaves exporters to the deployment.
pub fn start_telemetry(config: Option<&TelemetryConfig>) {
    match config.and_then(|t| t.statsd_address.as_deref()) {
        Some(addr) => tracing::info!(sink = %addr, "telemetry sink configured"),
        None => tracing::debug!("no telemetry sink configured"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("gatehouse.pid");

        store_pid_file(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        remove_pid_file(&path);
        assert!(!path.exists());
        // Removing twice is fine.
        remove_pid_file(&path);
    }
}
