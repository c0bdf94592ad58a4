//! Idle-wait strategies used between scheduler polls.
//!
//! When a poll pass frees no slot the scheduler hands control to a
//! [`SlotWaiter`]. The waiter decides how long to block before the next pass:
//! spin, sleep for a fixed interval, or park until a child's output streams
//! close (which is how a child exit is observed without a reaper thread).

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::PoolDefaults;

/// Exit notifications shared between the scheduler and output reader threads.
///
/// Readers call [`ExitSignal::notify`] when a stream reaches EOF. The counter
/// only ever increases, so a waiter compares against the generation it saw
/// before its poll pass and never misses a wakeup that raced with the pass.
#[derive(Debug, Default)]
pub struct ExitSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        *self.generation.lock().expect("exit signal lock poisoned")
    }

    /// Record that a child stream closed and wake every waiter.
    pub fn notify(&self) {
        let mut generation = self.generation.lock().expect("exit signal lock poisoned");
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until the generation moves past `seen` or `max` elapses.
    ///
    /// Returns `true` if a notification arrived.
    pub fn wait_past(&self, seen: u64, max: Duration) -> bool {
        let deadline = Instant::now() + max;
        let mut generation = self.generation.lock().expect("exit signal lock poisoned");
        while *generation == seen {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(generation, deadline - now)
                .expect("exit signal lock poisoned");
            generation = guard;
        }
        true
    }
}

/// Strategy for waiting until a running process may have finished.
pub trait SlotWaiter: Send + Sync + fmt::Debug {
    /// Block until a slot is likely free. `seen` is the [`ExitSignal`]
    /// generation observed before the last poll pass.
    fn wait_for_any_slot_free(&self, signal: &ExitSignal, seen: u64);
}

/// Return immediately, only yielding the thread. Polls as fast as the CPU allows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinWait;

impl SlotWaiter for SpinWait {
    fn wait_for_any_slot_free(&self, _signal: &ExitSignal, _seen: u64) {
        std::thread::yield_now();
    }
}

/// Sleep for a fixed interval between polls.
#[derive(Debug, Clone, Copy)]
pub struct SleepWait {
    pub interval: Duration,
}

impl SleepWait {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for SleepWait {
    fn default() -> Self {
        Self::new(PoolDefaults::IDLE_POLL_INTERVAL)
    }
}

impl SlotWaiter for SleepWait {
    fn wait_for_any_slot_free(&self, _signal: &ExitSignal, _seen: u64) {
        std::thread::sleep(self.interval);
    }
}

/// Park on the [`ExitSignal`] until a child stream closes, for at most `max`.
///
/// The bound keeps live output flowing for long-running children.
#[derive(Debug, Clone, Copy)]
pub struct ExitNotifyWait {
    pub max: Duration,
}

impl ExitNotifyWait {
    pub fn new(max: Duration) -> Self {
        Self { max }
    }
}

impl Default for ExitNotifyWait {
    fn default() -> Self {
        Self::new(PoolDefaults::IDLE_POLL_INTERVAL)
    }
}

impl SlotWaiter for ExitNotifyWait {
    fn wait_for_any_slot_free(&self, signal: &ExitSignal, seen: u64) {
        signal.wait_past(seen, self.max);
    }
}
