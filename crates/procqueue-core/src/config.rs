//! Scheduler configuration.
//!
//! Defaults live in [`PoolDefaults`]; a [`SchedulerConfig`] carries the live
//! values and can be overlaid with a JSON [`Settings`] file.

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default values for the process pool.
pub struct PoolDefaults;

impl PoolDefaults {
    pub const PROCESSES_LIMIT: usize = 10;
    pub const DISPATCH_DELAY: Duration = Duration::from_secs(2);
    pub const STOP_GRACE: Duration = Duration::from_secs(2);
    pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const LAUNCHER_ENV_VAR: &'static str = "PROCQUEUE_LAUNCHER";
    pub const FALLBACK_LAUNCHER: &'static str = "sh";
}

/// Live scheduler configuration.
///
/// Changes only affect future dispatch decisions, never processes that are
/// already running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently running processes.
    pub processes_limit: usize,
    /// Pause after each dispatch before the scheduler continues.
    pub delay: Duration,
    /// Wall-clock limit per process. `None` means unlimited.
    pub process_timeout: Option<Duration>,
    /// How long a stopped process gets to exit after SIGTERM before SIGKILL.
    pub stop_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            processes_limit: PoolDefaults::PROCESSES_LIMIT,
            delay: PoolDefaults::DISPATCH_DELAY,
            process_timeout: None,
            stop_grace: PoolDefaults::STOP_GRACE,
        }
    }
}

impl SchedulerConfig {
    /// Set the concurrency limit.
    pub fn with_processes_limit(mut self, limit: usize) -> Self {
        self.processes_limit = limit;
        self
    }

    /// Set the post-dispatch delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the per-process timeout. A zero duration means unlimited.
    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout_from(timeout);
        self
    }

    /// Set the stop grace period.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Check that the pool can make progress.
    pub fn validate(&self) -> Result<()> {
        if self.processes_limit == 0 {
            return Err(QueueError::Config {
                message: "processes_limit must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Convert a timeout where zero means "no limit".
pub(crate) fn timeout_from(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

/// Settings file contents. Every field is optional.
///
/// ```json
/// {
///   "processes_limit": 4,
///   "delay_secs": 0,
///   "process_timeout_secs": 30,
///   "launcher_path": "/usr/bin/php",
///   "entry_point": "artisan"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub processes_limit: Option<usize>,
    pub delay_secs: Option<u64>,
    pub process_timeout_secs: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub launcher_path: Option<PathBuf>,
    pub entry_point: Option<String>,
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| QueueError::io_with_path(e, path))?;
        serde_json::from_str(&content).map_err(|e| QueueError::Config {
            message: format!("invalid settings file {}: {}", path.display(), e),
        })
    }

    /// Overlay the values present in this file onto `config`.
    pub fn apply_to(&self, config: &mut SchedulerConfig) {
        if let Some(limit) = self.processes_limit {
            config.processes_limit = limit;
        }
        if let Some(delay) = self.delay_secs {
            config.delay = Duration::from_secs(delay);
        }
        if let Some(timeout) = self.process_timeout_secs {
            config.process_timeout = timeout_from(Duration::from_secs(timeout));
        }
        if let Some(grace) = self.stop_grace_ms {
            config.stop_grace = Duration::from_millis(grace);
        }
    }
}
