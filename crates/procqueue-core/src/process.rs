//! Owned handle to one dispatched child process.

use crate::command::CommandSpec;
use crate::error::{QueueError, Result};
use crate::platform;
use crate::wait::ExitSignal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Read;
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Observed state of a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Still running.
    Running,
    /// Exited on its own, successfully or not.
    Exited(ExitStatus),
    /// Exceeded its timeout and was killed.
    TimedOut,
}

impl ProcessState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ProcessState::Running)
    }
}

/// Output captured from a child, one buffer per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Snapshot of a running entry, safe to hand out of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningInfo {
    pub pid: u32,
    pub command: CommandSpec,
    /// Full invocation: executable, entry point, then command tokens.
    pub invocation: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// A live child process with captured output.
///
/// stdout and stderr are drained by one reader thread each into their own
/// buffer, so the scheduler never blocks on a pipe. When a stream reaches EOF
/// the reader notifies the [`ExitSignal`].
#[derive(Debug)]
pub struct RunningProcess {
    pid: u32,
    child: Child,
    command: CommandSpec,
    invocation: Vec<String>,
    started: Instant,
    started_at: DateTime<Utc>,
    timeout: Option<Duration>,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
}

impl RunningProcess {
    /// Take ownership of a freshly spawned child and start capturing its output.
    pub fn from_child(
        mut child: Child,
        command: CommandSpec,
        invocation: Vec<String>,
        timeout: Option<Duration>,
        signal: Arc<ExitSignal>,
    ) -> Result<Self> {
        let pid = child.id();
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));

        let readers = match start_readers(&mut child, &stdout, &stderr, signal) {
            Ok(readers) => readers,
            Err(e) => {
                warn!("Cannot capture output of process {}, killing it: {}", pid, e);
                discard_child(child);
                return Err(e);
            }
        };

        Ok(Self {
            pid,
            child,
            command,
            invocation,
            started: Instant::now(),
            started_at: Utc::now(),
            timeout,
            stdout,
            stderr,
            readers,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn info(&self) -> RunningInfo {
        RunningInfo {
            pid: self.pid,
            command: self.command.clone(),
            invocation: self.invocation.clone(),
            started_at: self.started_at,
        }
    }

    /// Output captured since the previous call.
    pub fn take_output(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: std::mem::take(&mut *self.stdout.lock().expect("output lock poisoned")),
            stderr: std::mem::take(&mut *self.stderr.lock().expect("output lock poisoned")),
        }
    }

    /// Output left after the process finished.
    ///
    /// Gives the reader threads up to `max` to hit EOF. A grandchild that
    /// inherited the pipes can keep them open indefinitely, so readers are
    /// detached rather than joined if they are still going.
    pub fn take_remaining_output(&mut self, max: Duration) -> CapturedOutput {
        let deadline = Instant::now() + max;
        while self.readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        for reader in self.readers.drain(..) {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        self.take_output()
    }

    /// Check whether the process is still running, enforcing its timeout.
    pub fn poll(&mut self) -> Result<ProcessState> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(ProcessState::Exited(status));
        }

        if let Some(timeout) = self.timeout {
            if self.started.elapsed() >= timeout {
                warn!(
                    "Process {} ({}) exceeded timeout of {:?}, killing",
                    self.pid, self.command, timeout
                );
                self.kill_and_reap()?;
                return Ok(ProcessState::TimedOut);
            }
        }

        Ok(ProcessState::Running)
    }

    /// Force kill the process right away and reap it.
    ///
    /// Returns the exit status if the process had already exited on its own.
    pub fn kill(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.child.try_wait()? {
            debug!("Process {} already exited with {}", self.pid, status);
            return Ok(Some(status));
        }
        self.kill_and_reap()?;
        Ok(None)
    }

    /// Terminate the process: SIGTERM, wait up to `grace`, then force kill.
    ///
    /// Always reaps the child. Returns the exit status if one was collected.
    pub fn stop(&mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.child.try_wait()? {
            debug!("Process {} already exited with {}", self.pid, status);
            return Ok(Some(status));
        }

        match platform::request_terminate(self.pid) {
            Ok(_) => {}
            Err(e) => warn!("Graceful stop of {} failed, forcing: {}", self.pid, e),
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait()? {
                debug!("Process {} terminated gracefully", self.pid);
                return Ok(Some(status));
            }
            thread::sleep(STOP_POLL_INTERVAL.min(grace));
        }

        debug!("Process {} still running, killing", self.pid);
        self.kill_and_reap().map(Some)
    }

    fn kill_and_reap(&mut self) -> Result<ExitStatus> {
        if let Err(e) = self.child.kill() {
            // InvalidInput means the child already exited
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(QueueError::TerminateFailed {
                    pid: self.pid,
                    message: e.to_string(),
                });
            }
        }
        Ok(self.child.wait()?)
    }
}

fn start_readers(
    child: &mut Child,
    stdout_sink: &Arc<Mutex<Vec<u8>>>,
    stderr_sink: &Arc<Mutex<Vec<u8>>>,
    signal: Arc<ExitSignal>,
) -> Result<Vec<JoinHandle<()>>> {
    let pid = child.id();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(pid, "stdout", stdout, stdout_sink.clone(), signal.clone())?);
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(pid, "stderr", stderr, stderr_sink.clone(), signal)?);
    }
    Ok(readers)
}

/// Kill and reap a child that never made it into a [`RunningProcess`].
fn discard_child(mut child: Child) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        debug!("Kill of abandoned process {} failed: {}", pid, e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap abandoned process {}: {}", pid, e);
    }
}

fn spawn_reader<R>(
    pid: u32,
    stream: &'static str,
    mut source: R,
    sink: Arc<Mutex<Vec<u8>>>,
    signal: Arc<ExitSignal>,
) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("procqueue-{}-{}", pid, stream))
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .expect("output lock poisoned")
                        .extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("Reading {} of process {} failed: {}", stream, pid, e);
                        break;
                    }
                }
            }
            signal.notify();
        })
        .map_err(QueueError::from)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sh(script: &str, timeout: Option<Duration>) -> (RunningProcess, Arc<ExitSignal>) {
        let signal = Arc::new(ExitSignal::new());
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let process = RunningProcess::from_child(
            child,
            CommandSpec::simple("test"),
            vec!["sh".into(), "-c".into(), script.into()],
            timeout,
            signal.clone(),
        )
        .unwrap();
        (process, signal)
    }

    fn wait_finished(process: &mut RunningProcess) -> ProcessState {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let state = process.poll().unwrap();
            if state.is_finished() || Instant::now() > deadline {
                return state;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_captures_stdout_and_stderr() {
        let (mut process, _) = spawn_sh("echo out; echo err 1>&2", None);
        let state = wait_finished(&mut process);
        assert!(matches!(state, ProcessState::Exited(s) if s.success()));

        let output = process.take_remaining_output(Duration::from_secs(5));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert!(process.take_output().is_empty());
    }

    #[test]
    fn test_failed_exit_is_finished() {
        let (mut process, _) = spawn_sh("exit 3", None);
        match wait_finished(&mut process) {
            ProcessState::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_timeout_kills() {
        let (mut process, _) = spawn_sh("exec sleep 30", Some(Duration::from_millis(100)));
        assert_eq!(wait_finished(&mut process), ProcessState::TimedOut);
        assert!(process.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_stop_running_process() {
        let (mut process, _) = spawn_sh("exec sleep 30", None);
        assert_eq!(process.poll().unwrap(), ProcessState::Running);

        let status = process.stop(Duration::from_secs(2)).unwrap();
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[test]
    fn test_stop_escalates_when_term_ignored() {
        let (mut process, _) = spawn_sh("trap '' TERM; exec sleep 30", None);
        // Give the shell time to install the trap.
        thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        let status = process.stop(Duration::from_millis(200)).unwrap();
        assert!(status.is_some());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_kill_does_not_wait_for_term_trap() {
        let (mut process, _) = spawn_sh("trap '' TERM; while :; do sleep 0.05; done", None);
        thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        assert_eq!(process.kill().unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!platform::is_process_alive(process.pid()));
    }

    #[test]
    fn test_kill_after_exit_returns_status() {
        let (mut process, _) = spawn_sh("exit 5", None);
        wait_finished(&mut process);
        let status = process.kill().unwrap().unwrap();
        assert_eq!(status.code(), Some(5));
    }

    #[test]
    fn test_discarded_child_is_reaped() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("exec sleep 30")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id();

        discard_child(child);
        assert!(!platform::is_process_alive(pid));
    }

    #[test]
    fn test_reader_eof_notifies_signal() {
        let (mut process, signal) = spawn_sh("true", None);
        wait_finished(&mut process);
        assert!(signal.wait_past(0, Duration::from_secs(5)));
    }

    #[test]
    fn test_info_snapshot() {
        let (mut process, _) = spawn_sh("true", None);
        let info = process.info();
        assert_eq!(info.pid, process.pid());
        assert_eq!(info.command, CommandSpec::simple("test"));
        assert_eq!(info.invocation[0], "sh");
        wait_finished(&mut process);
    }
}
