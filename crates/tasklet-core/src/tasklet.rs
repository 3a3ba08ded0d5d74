//! Tasklet structure and run state

use crate::error::SchedError;
use crate::stub::StubId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a Tasklet
///
/// Identity handle only: holding one keeps nothing alive, and it stays valid
/// (comparing equal) after the tasklet is gone.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskletId(u64);

static NEXT_TASKLET_ID: AtomicU64 = AtomicU64::new(1);

impl TaskletId {
    /// Generate a new unique TaskletId
    pub(crate) fn next() -> Self {
        TaskletId(NEXT_TASKLET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a TaskletId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        TaskletId(id)
    }
}

impl fmt::Display for TaskletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a Tasklet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskletState {
    /// Linked into the run queue
    Scheduled,
    /// The current tasklet of its scheduler
    Running,
    /// Alive but neither scheduled nor blocked
    Paused,
    /// Waiting on a channel or an external wake-up
    Blocked,
    /// Finished, failed or killed; its stub has been released
    Dead,
}

/// How a tasklet body ended
#[derive(Debug)]
pub(crate) enum Exit {
    /// Body returned `Ok`
    Finished,
    /// Body unwound because of a forced termination
    Killed,
    /// Body returned an error or panicked
    Failed(SchedError),
}

/// Per-tasklet bookkeeping owned by the scheduler state
#[derive(Debug)]
pub(crate) struct Tasklet {
    pub(crate) id: TaskletId,
    pub(crate) name: Option<String>,
    /// Stack this tasklet is bound to; `None` once released
    pub(crate) stub: Option<StubId>,
    pub(crate) state: TaskletState,
    pub(crate) is_main: bool,
    /// Body has started executing on its stub
    pub(crate) started: bool,
    /// Scheduled for forced termination
    pub(crate) kill_requested: bool,
    /// Soft interrupts are deferred while set
    pub(crate) atomic: bool,
    /// Blocking channel operations fail instead of blocking
    pub(crate) block_trap: bool,
    /// A wake-up arrived before the tasklet finished blocking
    pub(crate) wake_pending: bool,
    /// Tasklet to resume once this one has been unwound by a kill
    pub(crate) return_to: Option<TaskletId>,
    /// Error handed to this tasklet when it next resumes
    pub(crate) pending_error: Option<SchedError>,
}

impl Tasklet {
    /// Create the record for a freshly spawned tasklet
    pub(crate) fn new(id: TaskletId, name: Option<String>, stub: StubId) -> Self {
        Self {
            id,
            name,
            stub: Some(stub),
            state: TaskletState::Scheduled,
            is_main: false,
            started: false,
            kill_requested: false,
            atomic: false,
            block_trap: false,
            wake_pending: false,
            return_to: None,
            pending_error: None,
        }
    }

    /// Create the record for the main tasklet, which runs on the adopted caller stack
    pub(crate) fn main(id: TaskletId, stub: StubId) -> Self {
        Self {
            name: Some("main".to_string()),
            state: TaskletState::Running,
            is_main: true,
            started: true,
            ..Self::new(id, None, stub)
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state != TaskletState::Dead
    }

    pub(crate) fn info(&self, serial: Option<u64>) -> TaskletInfo {
        TaskletInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            is_main: self.is_main,
            started: self.started,
            atomic: self.atomic,
            block_trap: self.block_trap,
            kill_requested: self.kill_requested,
            serial,
        }
    }
}

/// Snapshot of a tasklet's externally visible state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskletInfo {
    /// Tasklet identity
    pub id: TaskletId,
    /// Optional name given at spawn time
    pub name: Option<String>,
    /// Run state
    pub state: TaskletState,
    /// True for the thread's main tasklet
    pub is_main: bool,
    /// True once the body has started running
    pub started: bool,
    /// Soft interrupts deferred
    pub atomic: bool,
    /// Blocking channel operations rejected
    pub block_trap: bool,
    /// Forced termination pending
    pub kill_requested: bool,
    /// Serial of the bound stub, `None` once released
    pub serial: Option<u64>,
}

impl TaskletInfo {
    /// Not yet finished
    pub fn alive(&self) -> bool {
        self.state != TaskletState::Dead
    }

    /// Linked into the run queue
    pub fn scheduled(&self) -> bool {
        self.state == TaskletState::Scheduled
    }

    /// Waiting on a channel or a wake-up
    pub fn blocked(&self) -> bool {
        self.state == TaskletState::Blocked
    }

    /// Alive, not running, not queued, not blocked
    pub fn paused(&self) -> bool {
        self.state == TaskletState::Paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasklet_id_uniqueness() {
        let id1 = TaskletId::next();
        let id2 = TaskletId::next();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
        assert_eq!(TaskletId::from_u64(id1.as_u64()), id1);
    }

    #[test]
    fn test_tasklet_id_display() {
        assert_eq!(TaskletId::from_u64(42).to_string(), "#42");
    }

    #[test]
    fn test_new_tasklet_is_scheduled() {
        let t = Tasklet::new(TaskletId::next(), Some("worker".into()), StubId::from_serial(3));
        assert_eq!(t.state, TaskletState::Scheduled);
        assert!(t.is_alive());
        assert!(!t.started);
        assert!(!t.is_main);

        let info = t.info(Some(3));
        assert!(info.scheduled());
        assert!(!info.blocked());
        assert_eq!(info.name.as_deref(), Some("worker"));
        assert_eq!(info.serial, Some(3));
    }

    #[test]
    fn test_main_tasklet_is_running() {
        let t = Tasklet::main(TaskletId::next(), StubId::from_serial(1));
        assert_eq!(t.state, TaskletState::Running);
        assert!(t.is_main);
        assert!(t.started);
        assert_eq!(t.name.as_deref(), Some("main"));
    }

    #[test]
    fn test_dead_tasklet_info() {
        let mut t = Tasklet::new(TaskletId::next(), None, StubId::from_serial(9));
        t.state = TaskletState::Dead;
        t.stub = None;
        let info = t.info(None);
        assert!(!info.alive());
        assert!(!info.paused());
        assert_eq!(info.serial, None);
    }
}
