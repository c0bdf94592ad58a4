//! Process launching.
//!
//! A [`Launcher`] turns a [`CommandSpec`] into an OS invocation:
//! `<executable> <entry point> <name> <args...>`. The executable is resolved
//! by [`LauncherPath::resolve`].

use crate::command::CommandSpec;
use crate::config::{PoolDefaults, Settings};
use crate::error::{QueueError, Result};
use crate::process::RunningProcess;
use crate::wait::ExitSignal;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Where a launcher executable path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherSource {
    /// Passed in explicitly.
    Explicit,
    /// `launcher_path` in the settings file.
    Settings,
    /// The `PROCQUEUE_LAUNCHER` environment variable.
    Environment,
    /// The executable of the current process.
    Detected,
    /// Nothing else was available.
    Fallback,
}

/// A resolved launcher executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherPath {
    pub path: PathBuf,
    pub source: LauncherSource,
}

impl LauncherPath {
    /// Resolve the launcher executable.
    ///
    /// Priority: explicit override, settings file, `PROCQUEUE_LAUNCHER`,
    /// the current executable, then the literal `sh`. Empty values are skipped.
    pub fn resolve(explicit: Option<&Path>, settings: Option<&Settings>) -> Self {
        Self::resolve_with(
            explicit,
            settings.and_then(|s| s.launcher_path.as_deref()),
            std::env::var_os(PoolDefaults::LAUNCHER_ENV_VAR),
            std::env::current_exe().ok(),
        )
    }

    fn resolve_with(
        explicit: Option<&Path>,
        configured: Option<&Path>,
        env_value: Option<OsString>,
        detected: Option<PathBuf>,
    ) -> Self {
        let non_empty = |p: &Path| !p.as_os_str().is_empty();

        if let Some(path) = explicit.filter(|p| non_empty(p)) {
            return Self::new(path, LauncherSource::Explicit);
        }
        if let Some(path) = configured.filter(|p| non_empty(p)) {
            return Self::new(path, LauncherSource::Settings);
        }
        if let Some(value) = env_value.filter(|v| !v.is_empty()) {
            return Self::new(PathBuf::from(value), LauncherSource::Environment);
        }
        if let Some(path) = detected.filter(|p| non_empty(p)) {
            return Self::new(path, LauncherSource::Detected);
        }
        Self::new(PoolDefaults::FALLBACK_LAUNCHER, LauncherSource::Fallback)
    }

    fn new(path: impl Into<PathBuf>, source: LauncherSource) -> Self {
        let path = path.into();
        debug!("Resolved launcher {} from {:?}", path.display(), source);
        Self { path, source }
    }
}

/// Builds and spawns command invocations.
#[derive(Debug, Clone)]
pub struct Launcher {
    executable: PathBuf,
    entry_point: Option<String>,
    working_dir: Option<PathBuf>,
    env_vars: HashMap<String, String>,
}

impl Launcher {
    /// Create a launcher. `entry_point` is the fixed first argument (for
    /// example an application script); `None` omits it.
    pub fn new(executable: impl Into<PathBuf>, entry_point: Option<String>) -> Self {
        Self {
            executable: executable.into(),
            entry_point,
            working_dir: None,
            env_vars: HashMap::new(),
        }
    }

    /// Set the working directory for launched processes.
    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable for launched processes.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// Replace the executable. Only affects future launches.
    pub fn set_executable(&mut self, executable: impl Into<PathBuf>) {
        self.executable = executable.into();
    }

    /// Full token list for `spec`: executable, entry point, name, args.
    pub fn invocation(&self, spec: &CommandSpec) -> Vec<String> {
        let mut tokens = vec![self.executable.to_string_lossy().into_owned()];
        tokens.extend(self.entry_point.iter().cloned());
        tokens.extend(spec.tokens());
        tokens
    }

    fn build_command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&self.executable);
        if let Some(ref entry_point) = self.entry_point {
            cmd.arg(entry_point);
        }
        cmd.args(spec.tokens());

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        cmd
    }

    /// Launch `spec` with captured output.
    pub fn spawn(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
        signal: Arc<ExitSignal>,
    ) -> Result<RunningProcess> {
        let mut cmd = self.build_command(spec);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {}", spec, e);
            QueueError::LaunchFailed {
                command: spec.to_string(),
                message: e.to_string(),
            }
        })?;

        debug!("Spawned {} as PID {}", spec, child.id());
        RunningProcess::from_child(child, spec.clone(), self.invocation(spec), timeout, signal)
    }

    /// Launch `spec` fire-and-forget with all output discarded.
    ///
    /// The child is moved into its own process group so terminal signals
    /// aimed at us do not reach it, and a detached thread reaps it on exit.
    /// Returns the child's PID.
    pub fn call_in_background(&self, spec: &CommandSpec) -> Result<u32> {
        let mut cmd = self.build_command(spec);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            // CREATE_NEW_PROCESS_GROUP detaches the process on Windows
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn().map_err(|e| QueueError::LaunchFailed {
            command: spec.to_string(),
            message: e.to_string(),
        })?;
        let pid = child.id();
        info!("Launched {} in background with PID {}", spec, pid);

        let reaper = thread::Builder::new()
            .name(format!("procqueue-reap-{}", pid))
            .spawn(move || match child.wait() {
                Ok(status) => debug!("Background process {} exited with {}", pid, status),
                Err(e) => warn!("Failed to reap background process {}: {}", pid, e),
            });
        if let Err(e) = reaper {
            warn!("Could not start reaper for background process {}: {}", pid, e);
        }

        Ok(pid)
    }
}
