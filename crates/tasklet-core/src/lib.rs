//! Tasklet Core Runtime
//!
//! This crate provides a cooperative tasklet scheduler including:
//! - Per-thread scheduler state with a FIFO run queue
//! - Execution stubs: coroutine stacks cloned from a blueprint and switched
//!   in user space on the scheduler's own thread
//! - Nested, re-entrant run passes
//! - Tick-based soft preemption (watchdog)
//! - Thread blocking gateway for cross-thread wake-ups
//! - Synchronous channels, carrying values or thrown errors
//!
//! ```no_run
//! use tasklet_core::{RunFlags, RunOutcome, Scheduler, SchedulerConfig};
//!
//! let sched = Scheduler::new(SchedulerConfig::default());
//! sched.spawn(|h| {
//!     h.yield_now()?;
//!     Ok(())
//! })?;
//! assert_eq!(sched.run(RunFlags::NONE)?, RunOutcome::Drained);
//! # Ok::<(), tasklet_core::SchedError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod channel;
pub mod config;
pub mod error;
#[cfg(feature = "thread-block")]
pub(crate) mod gateway;
pub mod queue;
pub mod release;
pub mod scheduler;
pub(crate) mod stub;
pub mod tasklet;
pub mod watchdog;

pub use channel::Channel;
pub use config::{RunFlags, SchedulerConfig, DEAD_RECORDS};
pub use error::{Invariant, SchedError, SchedResult, UnwindFailure};
pub use scheduler::{
    ErrorHandler, Handle, RunOutcome, ScheduleHook, Scheduler, SchedulerStats, SwitchTrapGuard,
    Waker,
};
pub use tasklet::{TaskletId, TaskletInfo, TaskletState};
pub use watchdog::InterruptHook;
