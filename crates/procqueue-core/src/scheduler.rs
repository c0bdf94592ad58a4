//! Bounded process pool scheduler.
//!
//! [`ProcessQueue`] owns a FIFO queue of [`CommandSpec`]s and a map of running
//! child processes keyed by PID. [`ProcessQueue::start`] fills the pool up to
//! the configured limit, then polls: live processes have their new output
//! forwarded, finished ones are reclaimed and their slot is handed to the next
//! queued command. It returns once the queue and the running set are both
//! empty.
//!
//! All state sits behind one mutex. The loop never holds it while sleeping
//! after a dispatch or while idle-waiting, so `enqueue`, `stop` and
//! `stop_process` can be called from other threads while `start` runs.

use crate::command::CommandSpec;
use crate::config::{timeout_from, SchedulerConfig};
use crate::error::{QueueError, Result};
use crate::launcher::Launcher;
use crate::process::{CapturedOutput, ProcessState, RunningInfo, RunningProcess};
use crate::wait::{ExitNotifyWait, ExitSignal, SlotWaiter};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long to wait for a finished process's readers to hit EOF.
const FINAL_OUTPUT_WAIT: Duration = Duration::from_millis(50);

/// How a reclaimed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { code: Option<i32> },
    TimedOut,
    Stopped,
}

/// Lifecycle notifications, delivered to the sink set with
/// [`ProcessQueue::set_event_sink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Dispatched {
        pid: u32,
        command: CommandSpec,
        /// Running count including this process.
        running: usize,
    },
    LaunchFailed {
        command: CommandSpec,
        message: String,
    },
    Reclaimed {
        pid: u32,
        command: CommandSpec,
        outcome: Outcome,
    },
}

/// Counters for one `start()` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub stopped: usize,
    pub launch_failures: usize,
    pub peak_running: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::TimedOut => self.timed_out += 1,
            Outcome::Stopped => self.stopped += 1,
        }
    }
}

struct PoolState {
    queue: VecDeque<CommandSpec>,
    running: BTreeMap<u32, RunningProcess>,
    config: SchedulerConfig,
    launcher: Launcher,
    waiter: Arc<dyn SlotWaiter>,
    events: Option<mpsc::Sender<PoolEvent>>,
    summary: RunSummary,
}

impl PoolState {
    fn emit(&self, event: PoolEvent) {
        if let Some(ref tx) = self.events {
            // A dropped receiver only means nobody is listening any more.
            let _ = tx.send(event);
        }
    }

    fn reclaimed(&mut self, pid: u32, command: CommandSpec, outcome: Outcome) {
        self.summary.record(outcome);
        self.emit(PoolEvent::Reclaimed {
            pid,
            command,
            outcome,
        });
    }
}

enum Dispatch {
    Launched,
    Failed,
    NoSlot,
    QueueEmpty,
}

enum EntryPoll {
    Alive(CapturedOutput),
    Finished(RunningProcess),
    Gone,
}

/// Bounded pool of child processes fed from a FIFO queue.
pub struct ProcessQueue {
    state: Mutex<PoolState>,
    output: Mutex<Box<dyn Write + Send>>,
    errors: Mutex<Box<dyn Write + Send>>,
    signal: Arc<ExitSignal>,
    active: AtomicBool,
}

impl ProcessQueue {
    /// Create a scheduler. Child stdout is forwarded to our stdout and child
    /// stderr to our stderr.
    pub fn new(config: SchedulerConfig, launcher: Launcher) -> Self {
        Self {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: BTreeMap::new(),
                config,
                launcher,
                waiter: Arc::new(ExitNotifyWait::default()),
                events: None,
                summary: RunSummary::default(),
            }),
            output: Mutex::new(Box::new(std::io::stdout())),
            errors: Mutex::new(Box::new(std::io::stderr())),
            signal: Arc::new(ExitSignal::new()),
            active: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("process queue lock poisoned")
    }

    /// Append a command to the tail of the queue.
    pub fn enqueue(&self, spec: impl Into<CommandSpec>) {
        let spec = spec.into();
        debug!("Queued {}", spec);
        self.lock().queue.push_back(spec);
    }

    /// Append several commands, keeping their order.
    pub fn enqueue_all<I>(&self, specs: I)
    where
        I: IntoIterator,
        I::Item: Into<CommandSpec>,
    {
        let mut state = self.lock();
        state.queue.extend(specs.into_iter().map(Into::into));
    }

    /// Run the queue to completion.
    ///
    /// Blocks until the queue and the running set are both empty. Launch
    /// failures are counted and skipped; exit codes never abort the run.
    pub fn start(&self) -> Result<RunSummary> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyRunning);
        }
        let _active = ActiveGuard(&self.active);

        {
            let mut state = self.lock();
            state.config.validate()?;
            state.summary = RunSummary::default();
            info!(
                "Starting process queue: {} queued, limit {}, delay {:?}",
                state.queue.len(),
                state.config.processes_limit,
                state.config.delay
            );
        }

        let started = Instant::now();
        self.fill_free_slots()?;

        while !self.is_drained() {
            let seen = self.signal.generation();
            let freed = self.poll_pass()?;
            let topped_up = self.fill_free_slots()?;

            if freed == 0 && topped_up == 0 {
                let waiter = self.lock().waiter.clone();
                waiter.wait_for_any_slot_free(&self.signal, seen);
            }
        }

        let summary = self.lock().summary;
        info!(
            "Process queue drained in {:?}: {} dispatched, {} succeeded, {} failed, {} timed out, {} stopped, {} launch failures",
            started.elapsed(),
            summary.dispatched,
            summary.succeeded,
            summary.failed,
            summary.timed_out,
            summary.stopped,
            summary.launch_failures
        );
        Ok(summary)
    }

    /// Clear the queue. With `kill_running`, also force kill every running
    /// process; otherwise running processes are left to finish.
    pub fn stop(&self, kill_running: bool) {
        let dropped = {
            let mut state = self.lock();
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        info!("Queue drained, {} pending commands dropped", dropped);

        if kill_running {
            self.kill_running_processes();
        }
    }

    /// Force kill every running process and clear the running set.
    ///
    /// Processes are killed outright, without a termination request or
    /// grace period, so this returns as soon as they are reaped.
    pub fn kill_running_processes(&self) {
        let killed = {
            let mut state = self.lock();
            if state.running.is_empty() {
                return;
            }
            info!("Killing {} running processes", state.running.len());

            let running = std::mem::take(&mut state.running);
            let mut killed = Vec::with_capacity(running.len());
            for (pid, mut process) in running {
                if let Err(e) = process.kill() {
                    error!("Failed to kill process {}: {}", pid, e);
                }
                state.reclaimed(pid, process.command().clone(), Outcome::Stopped);
                killed.push(process);
            }
            killed
        };

        for mut process in killed {
            let tail = process.take_remaining_output(FINAL_OUTPUT_WAIT);
            self.write_output(&tail);
        }
    }

    /// Stop one running process and remove it from the running set.
    ///
    /// The process gets a termination request and `stop_grace` to exit
    /// before it is force killed. The state lock is not held meanwhile.
    pub fn stop_process(&self, pid: u32) -> Result<()> {
        let (mut process, grace) = {
            let mut state = self.lock();
            let process = state
                .running
                .remove(&pid)
                .ok_or(QueueError::ProcessNotRunning { pid })?;
            (process, state.config.stop_grace)
        };

        info!("Stopping process {} ({})", pid, process.command());
        let stopped = process.stop(grace);
        self.lock()
            .reclaimed(pid, process.command().clone(), Outcome::Stopped);

        let tail = process.take_remaining_output(FINAL_OUTPUT_WAIT);
        self.write_output(&tail);
        stopped.map(|_| ())
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Snapshot of the pending commands, head first.
    pub fn queue(&self) -> Vec<CommandSpec> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Snapshot of the running processes, ordered by PID.
    pub fn running(&self) -> Vec<RunningInfo> {
        self.lock().running.values().map(RunningProcess::info).collect()
    }

    pub fn config(&self) -> SchedulerConfig {
        self.lock().config.clone()
    }

    /// Counters of the current or most recent run.
    pub fn summary(&self) -> RunSummary {
        self.lock().summary
    }

    /// Set the concurrency limit. Zero is rejected.
    pub fn set_processes_limit(&self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(QueueError::Config {
                message: "processes_limit must be at least 1".to_string(),
            });
        }
        self.lock().config.processes_limit = limit;
        Ok(())
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().config.delay = delay;
    }

    /// Set the per-process timeout for future dispatches. Zero means unlimited.
    pub fn set_process_timeout(&self, timeout: Duration) {
        self.lock().config.process_timeout = timeout_from(timeout);
    }

    pub fn set_stop_grace(&self, grace: Duration) {
        self.lock().config.stop_grace = grace;
    }

    pub fn set_launcher_path(&self, path: impl Into<PathBuf>) {
        self.lock().launcher.set_executable(path);
    }

    pub fn set_idle_wait(&self, waiter: Arc<dyn SlotWaiter>) {
        self.lock().waiter = waiter;
    }

    pub fn set_event_sink(&self, events: mpsc::Sender<PoolEvent>) {
        self.lock().events = Some(events);
    }

    /// Redirect the standard output of child processes, stdout by default.
    pub fn set_output(&self, output: Box<dyn Write + Send>) {
        *self.output.lock().expect("output lock poisoned") = output;
    }

    /// Redirect the standard error of child processes, stderr by default.
    pub fn set_error_output(&self, errors: Box<dyn Write + Send>) {
        *self.errors.lock().expect("error output lock poisoned") = errors;
    }

    fn is_drained(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && state.running.is_empty()
    }

    /// One pass over the running set. Every finished entry is reclaimed and
    /// its slot refilled before the next entry is looked at.
    fn poll_pass(&self) -> Result<usize> {
        let pids: Vec<u32> = self.lock().running.keys().copied().collect();
        let mut freed = 0;

        for pid in pids {
            match self.poll_entry(pid) {
                EntryPoll::Alive(chunk) => self.write_output(&chunk),
                EntryPoll::Finished(mut process) => {
                    let tail = process.take_remaining_output(FINAL_OUTPUT_WAIT);
                    self.write_output(&tail);
                    freed += 1;
                    self.refill_one()?;
                }
                EntryPoll::Gone => {}
            }
        }

        Ok(freed)
    }

    fn poll_entry(&self, pid: u32) -> EntryPoll {
        let mut state = self.lock();
        let Some(process) = state.running.get_mut(&pid) else {
            // Stopped from another thread since the pass began.
            return EntryPoll::Gone;
        };

        let outcome = match process.poll() {
            Ok(ProcessState::Running) => return EntryPoll::Alive(process.take_output()),
            Ok(ProcessState::Exited(status)) if status.success() => Outcome::Succeeded,
            Ok(ProcessState::Exited(status)) => Outcome::Failed {
                code: status.code(),
            },
            Ok(ProcessState::TimedOut) => Outcome::TimedOut,
            Err(e) => {
                warn!("Polling process {} failed, stopping it: {}", pid, e);
                if let Err(e) = process.stop(Duration::ZERO) {
                    error!("Failed to stop process {}: {}", pid, e);
                }
                Outcome::Failed { code: None }
            }
        };

        let Some(process) = state.running.remove(&pid) else {
            return EntryPoll::Gone;
        };
        info!(
            "Process {} ({}) finished after {:?}: {:?}",
            pid,
            process.command(),
            process.elapsed(),
            outcome
        );
        state.reclaimed(pid, process.command().clone(), outcome);
        EntryPoll::Finished(process)
    }

    /// Dispatch into a single freed slot, skipping commands that fail to launch.
    fn refill_one(&self) -> Result<()> {
        loop {
            match self.dispatch_next()? {
                Dispatch::Failed => continue,
                Dispatch::Launched | Dispatch::NoSlot | Dispatch::QueueEmpty => return Ok(()),
            }
        }
    }

    /// Dispatch until the pool is at its limit or the queue is empty.
    fn fill_free_slots(&self) -> Result<usize> {
        let mut launched = 0;
        loop {
            match self.dispatch_next()? {
                Dispatch::Launched => launched += 1,
                Dispatch::Failed => {}
                Dispatch::NoSlot | Dispatch::QueueEmpty => return Ok(launched),
            }
        }
    }

    /// Pop the queue head into a free slot, then pause for the configured delay.
    fn dispatch_next(&self) -> Result<Dispatch> {
        let delay = {
            let mut state = self.lock();
            if state.running.len() >= state.config.processes_limit {
                return Ok(Dispatch::NoSlot);
            }
            let Some(spec) = state.queue.pop_front() else {
                return Ok(Dispatch::QueueEmpty);
            };

            let timeout = state.config.process_timeout;
            match state.launcher.spawn(&spec, timeout, self.signal.clone()) {
                Ok(process) => {
                    let pid = process.pid();
                    debug_assert!(!state.running.contains_key(&pid));
                    state.running.insert(pid, process);

                    let running = state.running.len();
                    state.summary.dispatched += 1;
                    state.summary.peak_running = state.summary.peak_running.max(running);
                    info!("Dispatched {} as PID {} ({} running)", spec, pid, running);
                    state.emit(PoolEvent::Dispatched {
                        pid,
                        command: spec,
                        running,
                    });
                }
                Err(e) if e.is_dispatch_local() => {
                    error!("Skipping {}: {}", spec, e);
                    state.summary.launch_failures += 1;
                    state.emit(PoolEvent::LaunchFailed {
                        command: spec,
                        message: e.to_string(),
                    });
                    return Ok(Dispatch::Failed);
                }
                Err(e) => return Err(e),
            }

            state.config.delay
        };

        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(Dispatch::Launched)
    }

    fn write_output(&self, captured: &CapturedOutput) {
        if !captured.stdout.is_empty() {
            let mut output = self.output.lock().expect("output lock poisoned");
            forward(&mut **output, &captured.stdout, "output");
        }
        if !captured.stderr.is_empty() {
            let mut errors = self.errors.lock().expect("error output lock poisoned");
            forward(&mut **errors, &captured.stderr, "error output");
        }
    }
}

fn forward(sink: &mut (dyn Write + Send), bytes: &[u8], stream: &str) {
    if let Err(e) = sink.write_all(bytes).and_then(|_| sink.flush()) {
        warn!("Failed to forward process {}: {}", stream, e);
    }
}

impl std::fmt::Debug for ProcessQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ProcessQueue")
            .field("queued", &state.queue.len())
            .field("running", &state.running.len())
            .field("config", &state.config)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
