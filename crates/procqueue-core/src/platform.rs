//! Platform-specific process control.
//!
//! All `#[cfg]` blocks for OS-specific signalling live here so the scheduler
//! and process handle stay platform neutral.

use crate::error::{QueueError, Result};
use tracing::debug;

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)`; `EPERM` still means the process exists
/// - **Windows**: `tasklist` filtered by PID
///
/// A zombie that has not been reaped yet still counts as alive on Unix.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        use std::process::Command;

        let filter = format!("PID eq {}", pid);
        match Command::new("tasklist")
            .args(["/FI", &filter, "/NH", "/FO", "CSV"])
            .output()
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{}\"", pid)),
            Err(e) => {
                debug!("Failed to run tasklist: {}", e);
                false
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        tracing::warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Politely ask a process to exit.
///
/// # Platform Behavior
/// - **Linux/macOS**: sends SIGTERM
/// - **Windows**: `taskkill /PID {pid} /T` without `/F`
///
/// # Returns
/// `true` if the request was delivered, `false` if the process was already gone.
pub fn request_terminate(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| QueueError::TerminateFailed {
            pid,
            message: "pid out of range".to_string(),
        })?;

        debug!("Sending SIGTERM to process {}", pid);
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(QueueError::TerminateFailed {
                pid,
                message: e.to_string(),
            }),
        }
    }

    #[cfg(windows)]
    {
        use std::process::Command;

        debug!("Requesting termination of process {} with taskkill", pid);
        let output = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T"])
            .output()
            .map_err(|e| QueueError::TerminateFailed {
                pid,
                message: format!("failed to run taskkill: {}", e),
            })?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "not found" errors are OK - process already dead
        if stderr.contains("not found") || stderr.contains("not running") {
            Ok(false)
        } else {
            tracing::warn!("taskkill failed for {}: {}", pid, stderr);
            Err(QueueError::TerminateFailed {
                pid,
                message: stderr.trim().to_string(),
            })
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(QueueError::TerminateFailed {
            pid,
            message: "process termination not implemented for this platform".to_string(),
        })
    }
}
