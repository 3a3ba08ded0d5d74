//! Cooperative tasklet scheduler
//!
//! One [`Scheduler`] exists per OS thread. It owns the run queue, the stubs
//! its tasklets run on, the watchdog and the thread blocking gateway.
//! [`Handle`]s are cheap clones that tasklet bodies use to reach their
//! scheduler; they are `Send + Sync`, but every switching operation must be
//! issued from the scheduler's own OS thread, which all of its tasklets
//! share.

mod state;
mod switch;

pub use state::{ErrorHandler, ScheduleHook, SchedulerStats};

use crate::config::{RunFlags, SchedulerConfig};
use crate::error::{SchedError, SchedResult, UnwindFailure};
use crate::stub::{Resume, Suspender};
use crate::tasklet::{Tasklet, TaskletId, TaskletInfo, TaskletState};
use crate::watchdog::{InterruptHook, Tick};
use parking_lot::{Mutex, MutexGuard};
use state::{Departure, Pass, SchedulerState};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use switch::Body;
use tracing::{debug, trace, warn};

/// How a run pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run queue is empty
    Drained,
    /// The watchdog preempted this tasklet
    Interrupted(TaskletId),
    /// The pass stopped early (single step, failure absorbed elsewhere,
    /// or the caller was scheduled again) with work left in the queue
    Incomplete,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) config: SchedulerConfig,
}

/// Shareable reference to a scheduler
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

/// Per-thread cooperative scheduler.
///
/// Dropping the scheduler tears it down: every tasklet still bound to a
/// live stub is unwound.
pub struct Scheduler {
    handle: Handle,
    _not_send: PhantomData<*const ()>,
}

impl Scheduler {
    /// Create a scheduler. The calling thread becomes the main tasklet on
    /// first use.
    pub fn new(config: SchedulerConfig) -> Self {
        let mut state = SchedulerState::new();
        state.watchdog.set_interval(config.interval);
        Self {
            handle: Handle {
                shared: Arc::new(Shared {
                    state: Mutex::new(state),
                    config,
                }),
            },
            _not_send: PhantomData,
        }
    }

    /// A shareable handle to this scheduler
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Forcibly unwind every live tasklet and release the scheduler's
    /// resources. A second call does nothing.
    pub fn teardown(&self) -> SchedResult<()> {
        self.handle.teardown()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.handle.teardown() {
            warn!(error = %err, "scheduler teardown failed");
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scheduler").field(&self.handle).finish()
    }
}

/// Wakes one blocked tasklet, from any thread
#[derive(Clone)]
pub struct Waker {
    shared: Weak<Shared>,
    id: TaskletId,
}

impl Waker {
    /// The tasklet this waker wakes
    pub fn tasklet(&self) -> TaskletId {
        self.id
    }

    /// Make the tasklet runnable again. Returns false if it was neither
    /// blocked nor about to block, or its scheduler is gone.
    pub fn wake(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let woken = shared.state.lock().wake(self.id);
        trace!(tasklet = %self.id, woken, "wake");
        woken
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").field("tasklet", &self.id).finish()
    }
}

/// Keeps switching forbidden while alive
#[must_use = "the trap is lifted as soon as the guard is dropped"]
pub struct SwitchTrapGuard {
    handle: Handle,
}

impl Drop for SwitchTrapGuard {
    fn drop(&mut self) {
        self.handle.shared.state.lock().stubs.adjust_switch_trap(-1);
    }
}

impl Handle {
    pub(crate) fn lock_initialized(&self) -> SchedResult<MutexGuard<'_, SchedulerState>> {
        let mut st = self.shared.state.lock();
        if st.torn_down {
            return Err(SchedError::TornDown);
        }
        st.initialize(&self.shared.config);
        Ok(st)
    }

    /// Configuration this scheduler was created with
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    // ---------------------------------------------------------------------
    // Tasklet creation
    // ---------------------------------------------------------------------

    /// Spawn a tasklet at the tail of the run queue
    pub fn spawn<F>(&self, body: F) -> SchedResult<TaskletId>
    where
        F: FnOnce(&Handle) -> anyhow::Result<()> + Send + 'static,
    {
        self.spawn_inner(None, Box::new(body))
    }

    /// Spawn a named tasklet at the tail of the run queue
    pub fn spawn_named<F>(&self, name: impl Into<String>, body: F) -> SchedResult<TaskletId>
    where
        F: FnOnce(&Handle) -> anyhow::Result<()> + Send + 'static,
    {
        self.spawn_inner(Some(name.into()), Box::new(body))
    }

    fn spawn_inner(&self, name: Option<String>, body: Body) -> SchedResult<TaskletId> {
        let mut st = self.lock_initialized()?;
        st.check_mutation()?;

        let id = TaskletId::next();
        let handle = self.clone();
        let stub = st
            .stubs
            .create(Box::new(move |suspender: Suspender, signal: Resume| {
                handle.tasklet_main(id, suspender, signal, body)
            }))
            .map_err(SchedError::StackExhausted)?;

        st.tasklets.insert(id, Tasklet::new(id, name, stub));
        st.queue.push_back(id);
        st.stats.stubs_created += 1;
        debug!(tasklet = %id, serial = stub.serial(), "tasklet spawned");
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Switching
    // ---------------------------------------------------------------------

    /// Run queued tasklets until the pass ends.
    ///
    /// Must be called by the current tasklet; passes nest.
    pub fn run(&self, flags: RunFlags) -> SchedResult<RunOutcome> {
        let owner = {
            let mut st = self.lock_initialized()?;
            let owner = st.check_switching(&Departure::Run)?;
            st.interrupted = None;

            let prev_flags = st.runflags;
            st.runflags = flags;
            if st.queue.is_empty() && !st.can_park() {
                st.runflags = prev_flags;
                return Ok(RunOutcome::Drained);
            }

            let entry_serial = st.stubs.serial_last_jump();
            st.passes.push(Pass {
                owner,
                entry_serial,
                flags,
                steps: 0,
                prev_flags,
            });
            st.nesting_level += 1;
            debug!(owner = %owner, ?flags, nesting_level = st.nesting_level, "run pass started");
            owner
        };

        let result = self.depart(Departure::Run).map(drop);

        let mut st = self.shared.state.lock();
        if let Some(pos) = st.passes.iter().rposition(|pass| pass.owner == owner) {
            let pass = st.passes.remove(pos);
            st.runflags = pass.prev_flags;
        }
        st.nesting_level = st.nesting_level.saturating_sub(1);
        result?;

        let outcome = match st.interrupted {
            Some(id) if !flags.contains(RunFlags::CONTINUE_ON_INTERRUPT) => {
                RunOutcome::Interrupted(id)
            }
            _ if st.queue.is_empty() => RunOutcome::Drained,
            _ => RunOutcome::Incomplete,
        };
        debug!(owner = %owner, ?outcome, "run pass ended");
        Ok(outcome)
    }

    /// Requeue the current tasklet at the tail and run the next one
    pub fn yield_now(&self) -> SchedResult<()> {
        self.depart(Departure::Yield).map(drop)
    }

    /// Take the current tasklet out of the queue and run the next one.
    ///
    /// The tasklet stays alive, paused, until [`Handle::insert`]ed again.
    pub fn remove_current(&self) -> SchedResult<()> {
        self.depart(Departure::Remove).map(drop)
    }

    /// Block the current tasklet until its [`Waker`] fires.
    ///
    /// Wake-ups are not counted, so callers must tolerate returning without
    /// the awaited condition being met.
    pub fn park(&self) -> SchedResult<()> {
        self.depart(Departure::Block).map(drop)
    }

    /// Waker for the current tasklet
    pub fn waker(&self) -> SchedResult<Waker> {
        let st = self.lock_initialized()?;
        Ok(Waker {
            shared: Arc::downgrade(&self.shared),
            id: st.current_id()?,
        })
    }

    /// Forcibly unwind `victim`. Control returns here once it has finished
    /// unwinding. Killing a dead tasklet does nothing; killing oneself
    /// returns [`SchedError::TaskletExit`] to unwind the caller.
    pub fn kill(&self, victim: TaskletId) -> SchedResult<()> {
        {
            let mut st = self.lock_initialized()?;
            if st.is_reaped(victim) {
                return Ok(());
            }
            let t = st.tasklet(victim)?;
            if !t.is_alive() || t.stub.is_none() {
                return Ok(());
            }
            if t.is_main {
                return Err(SchedError::InvalidOperation(
                    "the main tasklet cannot be killed",
                ));
            }
            if st.current == Some(victim) {
                st.tasklet_mut(victim)?.kill_requested = true;
                return Err(SchedError::TaskletExit);
            }
        }
        debug!(tasklet = %victim, "killing tasklet");
        self.depart(Departure::Kill(victim)).map(drop)
    }

    /// Switch to `id` right away. The current tasklet goes to the tail of
    /// the run queue; a paused target is run without being inserted first.
    pub fn run_tasklet(&self, id: TaskletId) -> SchedResult<()> {
        self.depart(Departure::Direct(id)).map(drop)
    }

    /// Raise `err` in tasklet `id`: its pending blocking operation, or its
    /// body if it has not started yet, fails with [`SchedError::Thrown`].
    ///
    /// A blocked target is woken. With `immediate` the target runs at once
    /// and the caller goes to the tail of the run queue; otherwise the
    /// target is only made runnable. Throwing into the current tasklet
    /// returns the error to the caller.
    pub fn throw(
        &self,
        id: TaskletId,
        err: impl Into<anyhow::Error>,
        immediate: bool,
    ) -> SchedResult<()> {
        let err = SchedError::Thrown(err.into());
        {
            let mut st = self.lock_initialized()?;
            let me = st.current_id()?;
            if me == id {
                return Err(err);
            }
            if immediate {
                st.check_switching(&Departure::Direct(id))?;
            } else {
                st.check_mutation()?;
            }

            let t = st.tasklet_mut(id)?;
            let state = t.state;
            if state == TaskletState::Dead {
                return Err(SchedError::Dead(id));
            }
            if immediate && !t.started {
                t.return_to = Some(me);
            }
            if matches!(state, TaskletState::Blocked | TaskletState::Paused) {
                t.state = TaskletState::Scheduled;
                st.queue.push_back(id);
            }
            debug!(tasklet = %id, error = %err, immediate, "throwing into tasklet");
            st.deliver(id, err);
        }
        if immediate {
            self.depart(Departure::Direct(id))?;
        }
        Ok(())
    }

    /// Watchdog step. Returns true if the current tasklet was preempted
    /// (and has since been resumed), false if it kept running because
    /// nothing else was runnable.
    pub fn tick(&self) -> SchedResult<bool> {
        let (me, hook) = {
            let mut st = self.lock_initialized()?;
            let me = st.check_switching(&Departure::Interrupt)?;
            let atomic = st.tasklet(me)?.atomic;
            let suppressed = st.runflags.contains(RunFlags::NO_SOFT_INTERRUPT);
            match st.watchdog.tick(atomic, suppressed) {
                Tick::Idle => return Ok(false),
                Tick::Deferred => {
                    trace!(tasklet = %me, "interrupt deferred by atomic region");
                    return Ok(false);
                }
                Tick::Fire(hook) => {
                    st.schedlock += 1;
                    (me, hook)
                }
            }
        };

        let elected = {
            let _guard = SchedLockGuard {
                shared: &self.shared,
            };
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(me))).unwrap_or(false)
        };
        if !elected {
            return Ok(false);
        }

        debug!(tasklet = %me, "watchdog interrupt");
        self.depart(Departure::Interrupt)
    }

    // ---------------------------------------------------------------------
    // Queue manipulation
    // ---------------------------------------------------------------------

    /// Append a paused tasklet to the run queue
    pub fn insert(&self, id: TaskletId) -> SchedResult<()> {
        let mut st = self.lock_initialized()?;
        st.check_mutation()?;
        let t = st.tasklet_mut(id)?;
        match t.state {
            TaskletState::Dead => Err(SchedError::Dead(id)),
            TaskletState::Blocked => Err(SchedError::InvalidOperation(
                "cannot insert a blocked tasklet",
            )),
            TaskletState::Scheduled | TaskletState::Running => Ok(()),
            TaskletState::Paused => {
                t.state = TaskletState::Scheduled;
                st.queue.push_back(id);
                Ok(())
            }
        }
    }

    /// Take a scheduled tasklet out of the run queue, leaving it paused
    pub fn remove(&self, id: TaskletId) -> SchedResult<()> {
        let mut st = self.lock_initialized()?;
        st.check_mutation()?;
        let t = st.tasklet_mut(id)?;
        match t.state {
            TaskletState::Dead => Err(SchedError::Dead(id)),
            TaskletState::Running => Err(SchedError::InvalidOperation(
                "use remove_current to remove the running tasklet",
            )),
            TaskletState::Blocked => Err(SchedError::InvalidOperation(
                "cannot remove a blocked tasklet",
            )),
            TaskletState::Paused => Ok(()),
            TaskletState::Scheduled => {
                t.state = TaskletState::Paused;
                st.queue.remove(id);
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Policy
    // ---------------------------------------------------------------------

    /// Install the soft-interrupt policy: `hook` is offered the running
    /// tasklet every `interval` ticks. An interval of 0 disables it.
    pub fn set_interrupt<F>(&self, interval: u32, hook: F)
    where
        F: Fn(TaskletId) -> bool + Send + Sync + 'static,
    {
        let hook: InterruptHook = Arc::new(hook);
        self.shared.state.lock().watchdog.set(interval, hook);
    }

    /// Change the watchdog interval, keeping the installed hook
    pub fn set_interval(&self, interval: u32) {
        self.shared.state.lock().watchdog.set_interval(interval);
    }

    /// Remove the soft-interrupt policy
    pub fn clear_interrupt(&self) {
        self.shared.state.lock().watchdog.clear();
    }

    /// Call `hook(prev, next)` for every planned switch. Scheduling from
    /// inside the hook is rejected.
    pub fn set_schedule_callback<F>(&self, hook: F)
    where
        F: Fn(TaskletId, TaskletId) + Send + Sync + 'static,
    {
        self.shared.state.lock().schedule_hook = Some(Arc::new(hook));
    }

    /// Remove the schedule callback
    pub fn clear_schedule_callback(&self) {
        self.shared.state.lock().schedule_hook = None;
    }

    /// Offer tasklet failures to `handler` before they propagate
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(TaskletId, &anyhow::Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.state.lock().error_handler = Some(Arc::new(handler));
    }

    /// Remove the error handler
    pub fn clear_error_handler(&self) {
        self.shared.state.lock().error_handler = None;
    }

    /// Defer soft interrupts of the current tasklet. Returns the old value.
    pub fn set_atomic(&self, atomic: bool) -> SchedResult<bool> {
        let mut st = self.lock_initialized()?;
        let me = st.current_id()?;
        let t = st.tasklet_mut(me)?;
        Ok(std::mem::replace(&mut t.atomic, atomic))
    }

    /// Make blocking channel operations of the current tasklet fail.
    /// Returns the old value.
    pub fn set_block_trap(&self, block_trap: bool) -> SchedResult<bool> {
        let mut st = self.lock_initialized()?;
        let me = st.current_id()?;
        let t = st.tasklet_mut(me)?;
        Ok(std::mem::replace(&mut t.block_trap, block_trap))
    }

    /// Adjust the switch trap by `delta` and return the new level
    pub fn switch_trap(&self, delta: i32) -> i32 {
        self.shared.state.lock().stubs.adjust_switch_trap(delta)
    }

    /// Forbid switching until the guard is dropped
    pub fn trap_switches(&self) -> SwitchTrapGuard {
        self.switch_trap(1);
        SwitchTrapGuard {
            handle: self.clone(),
        }
    }

    /// Drop `value` right after the next switch completes
    pub fn defer_release<T: Send + 'static>(&self, value: T) {
        self.shared.state.lock().del_post_switch.defer(value);
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// The tasklet currently holding the stack
    pub fn current(&self) -> Option<TaskletId> {
        self.shared.state.lock().current
    }

    /// The main tasklet (the adopted caller thread)
    pub fn main(&self) -> Option<TaskletId> {
        self.shared.state.lock().main
    }

    /// Number of tasklets linked into the run queue
    pub fn runcount(&self) -> usize {
        self.shared.state.lock().queue.runcount()
    }

    /// Run queue order, head first
    pub fn queued(&self) -> Vec<TaskletId> {
        self.shared.state.lock().queue.order()
    }

    /// Number of stubs cloned from the blueprint so far
    pub fn serial(&self) -> u64 {
        self.shared.state.lock().stubs.serial()
    }

    /// Serial of the stub most recently switched to
    pub fn serial_last_jump(&self) -> u64 {
        self.shared.state.lock().stubs.serial_last_jump()
    }

    /// Number of active run passes
    pub fn nesting_level(&self) -> u32 {
        self.shared.state.lock().nesting_level
    }

    /// Tasklet preempted by the watchdog during the last pass
    pub fn interrupted(&self) -> Option<TaskletId> {
        self.shared.state.lock().interrupted
    }

    /// Current reentrancy guard level
    pub fn schedlock(&self) -> u32 {
        self.shared.state.lock().schedlock
    }

    /// Current switch trap level
    pub fn switch_trap_level(&self) -> i32 {
        self.shared.state.lock().stubs.switch_trap()
    }

    /// Watchdog interval in ticks, 0 when disabled
    pub fn interval(&self) -> u32 {
        self.shared.state.lock().watchdog.interval()
    }

    /// Remaining watchdog ticks
    pub fn ticker(&self) -> i64 {
        self.shared.state.lock().watchdog.ticker()
    }

    /// Number of tasklets waiting for a wake-up
    pub fn blocked_count(&self) -> usize {
        self.shared.state.lock().count(TaskletState::Blocked)
    }

    /// Snapshot of a tasklet. Finished tasklets are remembered for the
    /// last [`DEAD_RECORDS`](crate::config::DEAD_RECORDS) deaths.
    pub fn tasklet(&self, id: TaskletId) -> Option<TaskletInfo> {
        let st = self.shared.state.lock();
        match st.tasklets.get(&id) {
            Some(t) => Some(t.info(t.stub.map(|stub| stub.serial()))),
            None => st.dead_info(id).cloned(),
        }
    }

    /// Number of tasklet records held, live and remembered dead
    pub fn tasklet_count(&self) -> usize {
        let st = self.shared.state.lock();
        st.tasklets.len() + st.dead.len()
    }

    /// Scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.shared.state.lock().stats
    }

    /// True once the scheduler has been torn down
    pub fn is_torn_down(&self) -> bool {
        self.shared.state.lock().torn_down
    }

    /// True if both handles refer to the same scheduler
    pub fn same_scheduler(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ---------------------------------------------------------------------
    // Crate-internal
    // ---------------------------------------------------------------------

    /// Checks a blocking operation makes before registering as a waiter.
    /// Returns a waker for the current tasklet and its block trap flag.
    pub(crate) fn prepare_block(&self) -> SchedResult<(Waker, bool)> {
        let st = self.lock_initialized()?;
        let me = st.check_switching(&Departure::Block)?;
        let block_trap = st.tasklet(me)?.block_trap;
        Ok((
            Waker {
                shared: Arc::downgrade(&self.shared),
                id: me,
            },
            block_trap,
        ))
    }

    fn teardown(&self) -> SchedResult<()> {
        {
            let mut st = self.shared.state.lock();
            if st.torn_down {
                return Ok(());
            }
            if !st.is_initialized() {
                st.torn_down = true;
                st.stubs.release_blueprint();
                return Ok(());
            }
            if st.nesting_level > 0 {
                return Err(SchedError::InvalidOperation(
                    "cannot tear down while a run pass is active",
                ));
            }
            st.check_mutation()?;
        }

        let mut failures = Vec::new();
        let mut attempted = Vec::new();
        loop {
            let victims: Vec<TaskletId> = {
                let st = self.shared.state.lock();
                let mut ids: Vec<TaskletId> = st
                    .tasklets
                    .values()
                    .filter(|t| !t.is_main && t.is_alive() && t.stub.is_some())
                    .map(|t| t.id)
                    .filter(|id| !attempted.contains(id))
                    .collect();
                ids.sort();
                ids
            };
            if victims.is_empty() {
                break;
            }
            for id in victims {
                attempted.push(id);
                if let Err(error) = self.kill(id) {
                    warn!(tasklet = %id, %error, "tasklet did not unwind cleanly");
                    failures.push(UnwindFailure { id, error });
                }
            }
        }

        let batch = {
            let mut st = self.shared.state.lock();
            st.torn_down = true;
            st.queue.clear();
            st.interrupted = None;
            #[cfg(feature = "thread-block")]
            drop(st.thread.discard());
            st.stubs.release_blueprint();
            st.del_post_switch.take()
        };
        batch.run();

        debug!(
            killed = attempted.len(),
            failures = failures.len(),
            "scheduler torn down"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SchedError::Teardown(failures))
        }
    }
}

/// Clears one level of `schedlock` when dropped, on every exit path
pub(crate) struct SchedLockGuard<'a> {
    pub(crate) shared: &'a Shared,
}

impl Drop for SchedLockGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        st.schedlock = st.schedlock.saturating_sub(1);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Handle")
            .field("current", &st.current)
            .field("runcount", &st.queue.runcount())
            .field("nesting_level", &st.nesting_level)
            .field("torn_down", &st.torn_down)
            .finish()
    }
}
