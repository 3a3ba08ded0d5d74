//! Scheduler error types

use crate::tasklet::TaskletId;
use thiserror::Error;

/// Internal invariant that a scheduler operation tried to break.
///
/// These are never ordinary user errors: continuing after one of them would
/// corrupt the run queue or leave a stack in an unknown state, so the
/// offending operation is aborted before it mutates anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Invariant {
    /// A stack switch was requested while `switch_trap` was nonzero
    #[error("switch_trap: switching is forbidden in this region")]
    SwitchTrapped,

    /// A scheduling operation was requested while another one was in progress
    #[error("reentrant scheduling: schedlock is held")]
    ReentrantSchedule,

    /// The thread block primitive was released twice for one acquire
    #[error("thread block released twice")]
    BlockReleasedTwice,

    /// The thread block primitive was released while nobody was parked
    #[error("thread block released without acquire")]
    BlockReleasedWithoutAcquire,

    /// A switching operation was issued from an OS thread other than the scheduler's
    #[error("scheduler used from a thread other than its own")]
    ForeignThread,
}

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedError {
    /// Internal fault, distinguishable from user-level errors
    #[error("internal fault: {0}")]
    Internal(#[from] Invariant),

    /// A new stack could not be created from the blueprint
    #[error("cannot create stack for new tasklet: {0}")]
    StackExhausted(#[source] std::io::Error),

    /// The last runnable tasklet tried to block
    #[error("deadlock: the last runnable tasklet cannot be blocked")]
    Deadlock,

    /// A channel operation would block while the tasklet's block trap is set
    #[error("channel operation would block while block_trap is set")]
    BlockTrap,

    /// Forced termination; propagated to unwind the tasklet's stack
    #[error("tasklet exit")]
    TaskletExit,

    /// Operation on a tasklet that has already finished
    #[error("tasklet {0} is dead")]
    Dead(TaskletId),

    /// Operation on a tasklet this scheduler does not own
    #[error("unknown tasklet {0}")]
    UnknownTasklet(TaskletId),

    /// Operation not allowed in the tasklet's current state
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// A tasklet body failed and no error handler absorbed the failure
    #[error("tasklet {id} failed: {message}")]
    TaskletFailed {
        /// Failing tasklet
        id: TaskletId,
        /// Rendered error chain or panic payload
        message: String,
    },

    /// One or more tasklets failed while being unwound during teardown
    #[error("teardown finished with {} unwind failure(s)", .0.len())]
    Teardown(Vec<UnwindFailure>),

    /// An error raised into the tasklet by `throw` or a channel's `send_error`
    #[error("{0:#}")]
    Thrown(anyhow::Error),

    /// The scheduler has been torn down
    #[error("scheduler has been torn down")]
    TornDown,
}

impl SchedError {
    /// True for invariant violations (as opposed to recoverable errors)
    pub fn is_internal_fault(&self) -> bool {
        matches!(self, SchedError::Internal(_))
    }

    /// The violated invariant, if this is an internal fault
    pub fn invariant(&self) -> Option<Invariant> {
        match self {
            SchedError::Internal(inv) => Some(*inv),
            _ => None,
        }
    }

    /// True if this error is the forced-termination signal
    pub fn is_tasklet_exit(&self) -> bool {
        matches!(self, SchedError::TaskletExit)
    }
}

/// A tasklet whose forced unwind during teardown did not end cleanly
#[derive(Debug)]
pub struct UnwindFailure {
    /// The tasklet being unwound
    pub id: TaskletId,
    /// What went wrong
    pub error: SchedError,
}

/// Scheduler operation result
pub type SchedResult<T> = Result<T, SchedError>;

/// True if an error coming out of a tasklet body is the forced-termination signal.
pub(crate) fn is_exit(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SchedError>()
        .map(SchedError::is_tasklet_exit)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_fault_classification() {
        let err = SchedError::from(Invariant::SwitchTrapped);
        assert!(err.is_internal_fault());
        assert_eq!(err.invariant(), Some(Invariant::SwitchTrapped));
        assert!(err.to_string().contains("switch_trap"));

        assert!(!SchedError::Deadlock.is_internal_fault());
        assert_eq!(SchedError::Deadlock.invariant(), None);
    }

    #[test]
    fn test_thrown_renders_chain() {
        let err = SchedError::Thrown(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "outer: inner");
        assert!(!err.is_internal_fault());
        assert!(!err.is_tasklet_exit());
    }

    #[test]
    fn test_exit_survives_anyhow() {
        let err: anyhow::Error = SchedError::TaskletExit.into();
        assert!(is_exit(&err));

        let other = anyhow::anyhow!("boom");
        assert!(!is_exit(&other));
    }

    #[test]
    fn test_teardown_message_counts_failures() {
        let err = SchedError::Teardown(vec![
            UnwindFailure {
                id: TaskletId::from_u64(7),
                error: SchedError::Deadlock,
            },
            UnwindFailure {
                id: TaskletId::from_u64(8),
                error: SchedError::BlockTrap,
            },
        ]);
        assert_eq!(err.to_string(), "teardown finished with 2 unwind failure(s)");
    }
}
