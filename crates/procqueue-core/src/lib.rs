//! procqueue - bounded process pool fed from a FIFO command queue.
//!
//! Commands are queued as [`CommandSpec`]s and dispatched as child processes
//! of a [`Launcher`] (`<executable> <entry point> <name> <args...>`). At most
//! `processes_limit` children run at once; as each one finishes its slot is
//! handed to the next queued command until the queue and the pool are empty.
//!
//! # Example
//!
//! ```rust,no_run
//! use procqueue_core::{CommandSpec, Launcher, ProcessQueue, SchedulerConfig};
//! use std::time::Duration;
//!
//! fn main() -> procqueue_core::Result<()> {
//!     let config = SchedulerConfig::default()
//!         .with_processes_limit(4)
//!         .with_delay(Duration::from_millis(250));
//!     let launcher = Launcher::new("/usr/bin/php", Some("artisan".to_string()));
//!
//!     let queue = ProcessQueue::new(config, launcher);
//!     queue.enqueue("generate-invoices");
//!     queue.enqueue(CommandSpec::with_args("generate-user-invoice", [150]));
//!
//!     let summary = queue.start()?;
//!     println!("{} commands dispatched", summary.dispatched);
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod launcher;
pub mod platform;
pub mod process;
pub mod scheduler;
pub mod wait;

// Re-export commonly used types
pub use command::{parse_queue_json, CommandSpec};
pub use config::{PoolDefaults, SchedulerConfig, Settings};
pub use error::{QueueError, Result};
pub use launcher::{Launcher, LauncherPath, LauncherSource};
pub use process::{CapturedOutput, ProcessState, RunningInfo, RunningProcess};
pub use scheduler::{Outcome, PoolEvent, ProcessQueue, RunSummary};
pub use wait::{ExitNotifyWait, ExitSignal, SleepWait, SlotWaiter, SpinWait};
