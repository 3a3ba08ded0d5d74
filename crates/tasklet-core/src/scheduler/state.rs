//! Per-thread scheduler state and switch planning
//!
//! Everything in here runs under the scheduler lock and never blocks: a
//! departure is first applied to the leaving tasklet ([`SchedulerState::leave`]),
//! then a successor is selected ([`SchedulerState::select`]) and the switch is
//! committed ([`SchedulerState::commit`]). The physical switch happens later,
//! after the lock has been dropped.

use crate::config::{RunFlags, SchedulerConfig, DEAD_RECORDS};
use crate::error::{Invariant, SchedError, SchedResult};
#[cfg(feature = "thread-block")]
use crate::gateway::{Gateway, ThreadBlock};
use crate::queue::RunQueue;
use crate::release::DeferredReleases;
use crate::stub::{Resume, StubManager, Transfer};
use crate::tasklet::{Exit, Tasklet, TaskletId, TaskletInfo, TaskletState};
use crate::watchdog::Watchdog;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
#[cfg(feature = "thread-block")]
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Callback invoked for every planned switch with `(prev, next)`
pub type ScheduleHook = std::sync::Arc<dyn Fn(TaskletId, TaskletId) + Send + Sync>;

/// Handler offered every tasklet failure, in the failing tasklet's context.
/// Returning `Ok` absorbs the failure.
pub type ErrorHandler =
    std::sync::Arc<dyn Fn(TaskletId, &anyhow::Error) -> anyhow::Result<()> + Send + Sync>;

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Physical stack switches performed
    pub switches: u64,
    /// Stubs cloned from the blueprint
    pub stubs_created: u64,
    /// Switches back to a run pass's entry stack
    pub corrective_switches: u64,
    /// Tasklets preempted by the watchdog
    pub interrupts: u64,
    /// Tasklets whose body returned normally
    pub tasklets_finished: u64,
    /// Tasklets unwound by a kill
    pub tasklets_killed: u64,
    /// Tasklets whose failure was not absorbed
    pub tasklets_failed: u64,
}

/// An active run pass
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pass {
    /// Tasklet that called `run` and gets control back
    pub(crate) owner: TaskletId,
    /// Serial of the stack `run` was entered on
    pub(crate) entry_serial: u64,
    pub(crate) flags: RunFlags,
    /// Number of times a tasklet gave up control during the pass
    pub(crate) steps: u32,
    /// Run flags of the enclosing pass
    pub(crate) prev_flags: RunFlags,
}

/// Why the current tasklet is giving up its stack
#[derive(Debug)]
pub(crate) enum Departure {
    /// Requeue at the tail and run the next tasklet
    Yield,
    /// Wait for a wake-up
    Block,
    /// Leave the queue without blocking
    Remove,
    /// Start a run pass owned by the leaving tasklet
    Run,
    /// Preempted by the watchdog
    Interrupt,
    /// Switch into a victim to unwind it
    Kill(TaskletId),
    /// Requeue at the tail and run the given tasklet next
    Direct(TaskletId),
    /// The tasklet's body is over
    Finish(Exit),
}

impl Departure {
    /// Departures that count as "a tasklet gave up control" for a pass
    fn is_step(&self) -> bool {
        !matches!(self, Departure::Run | Departure::Kill(_))
    }
}

/// Outcome of selecting a successor
pub(crate) enum Selection {
    /// The leaving tasklet keeps running
    Stay,
    /// Switch to `next`
    Switch {
        next: TaskletId,
        signal: Resume,
        corrective: bool,
        deadlock: bool,
    },
    /// Nothing runnable but blocked tasklets exist: park the OS thread
    #[cfg(feature = "thread-block")]
    Park(Arc<ThreadBlock>),
}

/// A committed switch, ready to be performed without the lock
pub(crate) enum Plan {
    Stay,
    Switch {
        prev: TaskletId,
        next: TaskletId,
        transfer: Transfer,
    },
}

/// Scheduler state of one OS thread
pub(crate) struct SchedulerState {
    /// Blueprint, main stub, serials, switch trap and live stubs
    pub(crate) stubs: StubManager,
    pub(crate) main: Option<TaskletId>,
    pub(crate) current: Option<TaskletId>,
    pub(crate) queue: RunQueue,
    pub(crate) watchdog: Watchdog,
    pub(crate) schedlock: u32,
    pub(crate) runflags: RunFlags,
    #[cfg(feature = "thread-block")]
    pub(crate) thread: Gateway,
    pub(crate) thread_block: bool,
    pub(crate) nesting_level: u32,
    pub(crate) del_post_switch: DeferredReleases,
    pub(crate) interrupted: Option<TaskletId>,
    pub(crate) tasklets: FxHashMap<TaskletId, Tasklet>,
    /// Last records of reaped tasklets, oldest first
    pub(crate) dead: VecDeque<TaskletInfo>,
    pub(crate) passes: Vec<Pass>,
    pub(crate) schedule_hook: Option<ScheduleHook>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) torn_down: bool,
    pub(crate) stats: SchedulerStats,
}

impl SchedulerState {
    pub(crate) fn new() -> Self {
        Self {
            stubs: StubManager::new(),
            main: None,
            current: None,
            queue: RunQueue::new(),
            watchdog: Watchdog::new(),
            schedlock: 0,
            runflags: RunFlags::NONE,
            #[cfg(feature = "thread-block")]
            thread: Gateway::new(),
            thread_block: false,
            nesting_level: 0,
            del_post_switch: DeferredReleases::new(),
            interrupted: None,
            tasklets: FxHashMap::default(),
            dead: VecDeque::new(),
            passes: Vec::new(),
            schedule_hook: None,
            error_handler: None,
            torn_down: false,
            stats: SchedulerStats::default(),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.main.is_some()
    }

    /// Create the blueprint and adopt the calling thread as the main tasklet
    pub(crate) fn initialize(&mut self, config: &SchedulerConfig) {
        if self.is_initialized() {
            return;
        }
        self.stubs.ensure_blueprint(config.stack_size);
        let stub = self.stubs.adopt_current();
        let id = TaskletId::next();
        self.tasklets.insert(id, Tasklet::main(id, stub));
        self.main = Some(id);
        self.current = Some(id);
        self.thread_block = config.thread_block;
        debug!(main = %id, stack_size = config.stack_size, "scheduler initialized");
    }

    pub(crate) fn current_id(&self) -> SchedResult<TaskletId> {
        self.current
            .ok_or(SchedError::InvalidOperation("scheduler has no current tasklet"))
    }

    pub(crate) fn tasklet(&self, id: TaskletId) -> SchedResult<&Tasklet> {
        self.tasklets.get(&id).ok_or_else(|| self.missing(id))
    }

    pub(crate) fn tasklet_mut(&mut self, id: TaskletId) -> SchedResult<&mut Tasklet> {
        if !self.tasklets.contains_key(&id) {
            return Err(self.missing(id));
        }
        self.tasklets.get_mut(&id).ok_or(SchedError::UnknownTasklet(id))
    }

    fn missing(&self, id: TaskletId) -> SchedError {
        if self.is_reaped(id) {
            SchedError::Dead(id)
        } else {
            SchedError::UnknownTasklet(id)
        }
    }

    /// Record of a reaped tasklet, while it is still remembered
    pub(crate) fn dead_info(&self, id: TaskletId) -> Option<&TaskletInfo> {
        self.dead.iter().rev().find(|info| info.id == id)
    }

    pub(crate) fn is_reaped(&self, id: TaskletId) -> bool {
        self.dead_info(id).is_some()
    }

    /// Checks every switching operation makes before touching any state.
    /// Returns the current tasklet.
    pub(crate) fn check_switching(&self, dep: &Departure) -> SchedResult<TaskletId> {
        if self.torn_down {
            return Err(SchedError::TornDown);
        }
        if self.schedlock != 0 {
            return Err(Invariant::ReentrantSchedule.into());
        }
        self.stubs.check_thread()?;
        let me = self.current_id()?;
        if matches!(dep, Departure::Finish(_)) {
            return Ok(me);
        }
        if self.tasklet(me)?.kill_requested {
            return Err(SchedError::TaskletExit);
        }
        if self.stubs.switch_trap() != 0 {
            return Err(Invariant::SwitchTrapped.into());
        }
        Ok(me)
    }

    /// Checks for operations that mutate the queue without switching
    pub(crate) fn check_mutation(&self) -> SchedResult<()> {
        if self.torn_down {
            return Err(SchedError::TornDown);
        }
        if self.schedlock != 0 {
            return Err(Invariant::ReentrantSchedule.into());
        }
        self.stubs.check_thread()
    }

    /// Thread blocking is allowed for the innermost pass
    pub(crate) fn thread_block_enabled(&self) -> bool {
        cfg!(feature = "thread-block")
            && (self.thread_block || self.runflags.contains(RunFlags::THREAD_BLOCK))
    }

    /// Nothing is runnable, but waiting for an external wake-up could help
    pub(crate) fn can_park(&self) -> bool {
        self.thread_block_enabled()
            && self
                .tasklets
                .values()
                .any(|t| t.state == TaskletState::Blocked)
    }

    fn count_step(&mut self, me: TaskletId, delta: i32) {
        if let Some(pass) = self.passes.last_mut() {
            if pass.owner != me {
                pass.steps = pass.steps.saturating_add_signed(delta);
            }
        }
    }

    /// Apply a departure to the leaving tasklet. Returns false if it keeps
    /// running without selecting a successor.
    pub(crate) fn leave(&mut self, me: TaskletId, dep: &Departure) -> SchedResult<bool> {
        match dep {
            Departure::Yield | Departure::Interrupt => {
                self.tasklet_mut(me)?.state = TaskletState::Scheduled;
                self.queue.push_back(me);
            }
            Departure::Direct(target) => {
                if *target == me {
                    return Ok(false);
                }
                match self.tasklet(*target)?.state {
                    TaskletState::Dead => return Err(SchedError::Dead(*target)),
                    TaskletState::Blocked => {
                        return Err(SchedError::InvalidOperation("cannot run a blocked tasklet"))
                    }
                    _ => {}
                }
                self.tasklet_mut(me)?.state = TaskletState::Scheduled;
                self.queue.push_back(me);
            }
            Departure::Block => {
                let t = self.tasklet_mut(me)?;
                if t.wake_pending {
                    t.wake_pending = false;
                    return Ok(false);
                }
                t.state = TaskletState::Blocked;
            }
            Departure::Remove | Departure::Run => {
                self.tasklet_mut(me)?.state = TaskletState::Paused;
            }
            Departure::Kill(victim) => {
                let victim = self.tasklet_mut(*victim)?;
                victim.kill_requested = true;
                victim.return_to = Some(me);
                victim.wake_pending = false;
                self.tasklet_mut(me)?.state = TaskletState::Paused;
            }
            Departure::Finish(_) => {
                self.tasklet_mut(me)?.state = TaskletState::Dead;
            }
        }
        if dep.is_step() {
            self.count_step(me, 1);
        }
        Ok(true)
    }

    /// Undo `leave` for a departure that found nowhere to go
    fn rollback(&mut self, me: TaskletId, dep: &Departure) {
        if let Some(t) = self.tasklets.get_mut(&me) {
            t.state = TaskletState::Running;
        }
        if dep.is_step() {
            self.count_step(me, -1);
        }
    }

    /// Pick the tasklet to run after `me` has left
    pub(crate) fn select(&mut self, me: TaskletId, dep: &Departure) -> SchedResult<Selection> {
        if let Departure::Kill(victim) = dep {
            return Ok(Selection::Switch {
                next: *victim,
                signal: Resume::Unwind,
                corrective: false,
                deadlock: false,
            });
        }
        if let Departure::Direct(target) = dep {
            return Ok(self.switch_plain(*target));
        }

        if let Departure::Finish(exit) = dep {
            let killer = self
                .tasklets
                .get(&me)
                .and_then(|t| t.return_to)
                .filter(|k| self.tasklets.get(k).is_some_and(Tasklet::is_alive));
            if let Some(killer) = killer {
                return Ok(self.switch_plain(killer));
            }
            if matches!(exit, Exit::Failed(_)) {
                if let Some(selection) = self.return_to_owner(me) {
                    return Ok(selection);
                }
                if let Some(main) = self.main.filter(|&main| main != me) {
                    return Ok(self.switch_plain(main));
                }
            }
        }

        if let Some(pass) = self.passes.last() {
            if pass.owner != me {
                let single_step =
                    pass.flags.contains(RunFlags::SINGLE_STEP) && pass.steps > 0;
                let interrupted = matches!(dep, Departure::Interrupt)
                    && !pass.flags.contains(RunFlags::CONTINUE_ON_INTERRUPT);
                if single_step || interrupted {
                    if let Some(selection) = self.return_to_owner(me) {
                        return Ok(selection);
                    }
                }
            }
        }

        if let Some(next) = self.queue.pop_front() {
            if next == me {
                self.tasklet_mut(me)?.state = TaskletState::Running;
                return Ok(Selection::Stay);
            }
            return Ok(self.switch_plain(next));
        }

        #[cfg(feature = "thread-block")]
        if self.can_park() {
            trace!(tasklet = %me, "nothing runnable, parking scheduler thread");
            return Ok(Selection::Park(self.thread.prepare_park()));
        }

        if let Some(selection) = self.return_to_owner(me) {
            return Ok(selection);
        }

        match dep {
            Departure::Finish(_) => match self.main.filter(|&main| main != me) {
                Some(main) => Ok(Selection::Switch {
                    next: main,
                    signal: Resume::Continue,
                    corrective: false,
                    deadlock: true,
                }),
                None => Err(SchedError::InvalidOperation("no tasklet left to switch to")),
            },
            Departure::Run => {
                self.rollback(me, dep);
                Ok(Selection::Stay)
            }
            _ => {
                self.rollback(me, dep);
                Err(SchedError::Deadlock)
            }
        }
    }

    fn switch_plain(&self, next: TaskletId) -> Selection {
        Selection::Switch {
            next,
            signal: Resume::Continue,
            corrective: false,
            deadlock: false,
        }
    }

    /// End the innermost pass by switching back to its owner
    fn return_to_owner(&self, me: TaskletId) -> Option<Selection> {
        let pass = self.passes.last().filter(|pass| pass.owner != me)?;
        Some(Selection::Switch {
            next: pass.owner,
            signal: Resume::Continue,
            corrective: self.stubs.serial_last_jump() != pass.entry_serial,
            deadlock: false,
        })
    }

    /// Commit a selection: update state, prepare the transfer
    pub(crate) fn commit(
        &mut self,
        me: TaskletId,
        dep: Departure,
        selection: Selection,
    ) -> SchedResult<Plan> {
        let (next, signal, corrective, deadlock) = match selection {
            Selection::Stay => return Ok(Plan::Stay),
            Selection::Switch {
                next,
                signal,
                corrective,
                deadlock,
            } => (next, signal, corrective, deadlock),
            #[cfg(feature = "thread-block")]
            Selection::Park(_) => {
                return Err(SchedError::InvalidOperation("cannot commit a park"))
            }
        };

        let stub = self
            .tasklet(next)?
            .stub
            .ok_or(SchedError::Dead(next))?;
        let transfer = self.stubs.prepare_switch(stub, signal)?;
        self.queue.remove(next);

        match dep {
            Departure::Finish(exit) => self.retire(me, exit, next),
            Departure::Interrupt => {
                self.interrupted = Some(me);
                self.stats.interrupts += 1;
            }
            _ => {}
        }
        if deadlock {
            self.deliver(next, SchedError::Deadlock);
        }

        let t = self.tasklet_mut(next)?;
        t.state = TaskletState::Running;
        t.wake_pending = false;
        self.current = Some(next);
        self.watchdog.reset();
        self.stats.switches += 1;
        if corrective {
            self.stats.corrective_switches += 1;
        }
        trace!(
            prev = %me,
            next = %next,
            serial = stub.serial(),
            corrective,
            "switch planned"
        );

        Ok(Plan::Switch {
            prev: me,
            next,
            transfer,
        })
    }

    /// Reap a finished tasklet: release its stub, keep a tombstone and
    /// route its failure
    fn retire(&mut self, me: TaskletId, exit: Exit, next: TaskletId) {
        if let Some(mut t) = self.tasklets.remove(&me) {
            if let Some(stub) = t.stub.take() {
                self.stubs.retire(stub);
            }
            t.pending_error = None;
            self.bury(t.info(None));
        }

        match exit {
            Exit::Finished => {
                self.stats.tasklets_finished += 1;
                debug!(tasklet = %me, "tasklet finished");
            }
            Exit::Killed => {
                self.stats.tasklets_killed += 1;
                debug!(tasklet = %me, "tasklet killed");
            }
            Exit::Failed(err) => {
                self.stats.tasklets_failed += 1;
                debug!(tasklet = %me, to = %next, error = %err, "tasklet failed");
                self.deliver(next, err);
            }
        }
    }

    fn bury(&mut self, info: TaskletInfo) {
        if self.dead.len() >= DEAD_RECORDS {
            self.dead.pop_front();
        }
        self.dead.push_back(info);
    }

    /// Hand `err` to `id`, to be returned when it next resumes
    pub(crate) fn deliver(&mut self, id: TaskletId, err: SchedError) {
        if let Some(t) = self.tasklets.get_mut(&id) {
            if let Some(lost) = t.pending_error.replace(err) {
                error!(tasklet = %id, error = %lost, "pending error overwritten");
            }
        }
    }

    /// Make a blocked tasklet runnable again, or remember the wake-up if it
    /// has not finished blocking yet
    pub(crate) fn wake(&mut self, id: TaskletId) -> bool {
        let Some(t) = self.tasklets.get_mut(&id) else {
            return false;
        };
        match t.state {
            TaskletState::Blocked => {
                t.state = TaskletState::Scheduled;
                self.queue.push_back(id);
                #[cfg(feature = "thread-block")]
                self.thread.wake();
                true
            }
            TaskletState::Running => {
                t.wake_pending = true;
                true
            }
            _ => false,
        }
    }

    /// Number of tasklets in the given state
    pub(crate) fn count(&self, state: TaskletState) -> usize {
        self.tasklets.values().filter(|t| t.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SchedulerState {
        let mut st = SchedulerState::new();
        st.initialize(&SchedulerConfig::default());
        st
    }

    #[test]
    fn test_new_state_is_empty() {
        let st = SchedulerState::new();
        assert!(!st.is_initialized());
        assert_eq!(st.queue.runcount(), 0);
        assert_eq!(st.schedlock, 0);
        assert_eq!(st.nesting_level, 0);
        assert!(st.interrupted.is_none());
        assert!(st.del_post_switch.is_empty());
        assert_eq!(st.stubs.serial(), 0);
    }

    #[test]
    fn test_initialize_adopts_main() {
        let st = state();
        let main = st.main.unwrap();
        assert_eq!(st.current, Some(main));
        assert!(st.tasklets[&main].is_main);
        assert_eq!(st.stubs.serial(), 0);
        assert!(st.stubs.has_blueprint());
    }

    #[test]
    fn test_schedlock_rejects_switching() {
        let mut st = state();
        st.schedlock = 1;
        let err = st.check_switching(&Departure::Yield).unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::ReentrantSchedule));
        assert!(st.check_mutation().is_err());
    }

    #[test]
    fn test_yield_alone_stays() {
        let mut st = state();
        let main = st.main.unwrap();
        assert!(st.leave(main, &Departure::Yield).unwrap());
        assert!(matches!(
            st.select(main, &Departure::Yield).unwrap(),
            Selection::Stay
        ));
        assert_eq!(st.tasklets[&main].state, TaskletState::Running);
        assert_eq!(st.queue.runcount(), 0);
    }

    #[test]
    fn test_block_alone_is_deadlock() {
        let mut st = state();
        let main = st.main.unwrap();
        st.leave(main, &Departure::Block).unwrap();
        let err = st.select(main, &Departure::Block).err().unwrap();
        assert!(matches!(err, SchedError::Deadlock));
        assert_eq!(st.tasklets[&main].state, TaskletState::Running);
    }

    #[test]
    fn test_pending_wake_skips_block() {
        let mut st = state();
        let main = st.main.unwrap();
        assert!(st.wake(main));
        assert!(!st.leave(main, &Departure::Block).unwrap());
        assert!(!st.tasklets[&main].wake_pending);
    }

    #[test]
    fn test_interrupt_alone_is_not_recorded() {
        let mut st = state();
        let main = st.main.unwrap();
        let dep = Departure::Interrupt;
        assert!(st.leave(main, &dep).unwrap());
        let selection = st.select(main, &dep).unwrap();
        assert!(matches!(st.commit(main, dep, selection).unwrap(), Plan::Stay));
        assert!(st.interrupted.is_none());
        assert_eq!(st.stats.interrupts, 0);
        assert_eq!(st.tasklets[&main].state, TaskletState::Running);
    }

    #[test]
    fn test_direct_to_self_stays() {
        let mut st = state();
        let main = st.main.unwrap();
        assert!(!st.leave(main, &Departure::Direct(main)).unwrap());
        assert_eq!(st.queue.runcount(), 0);

        let stranger = TaskletId::next();
        let err = st.leave(main, &Departure::Direct(stranger)).err().unwrap();
        assert!(matches!(err, SchedError::UnknownTasklet(id) if id == stranger));
        assert_eq!(st.tasklets[&main].state, TaskletState::Running);
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let mut st = state();
        let mut ids = Vec::new();
        for _ in 0..DEAD_RECORDS + 10 {
            let id = TaskletId::next();
            let mut t = Tasklet::new(id, None, crate::stub::StubId::from_serial(1));
            t.state = TaskletState::Dead;
            st.bury(t.info(None));
            ids.push(id);
        }
        assert_eq!(st.dead.len(), DEAD_RECORDS);
        assert!(!st.is_reaped(ids[0]));
        assert!(matches!(st.tasklet(ids[0]), Err(SchedError::UnknownTasklet(_))));

        let last = *ids.last().unwrap();
        assert!(st.is_reaped(last));
        assert!(matches!(st.tasklet_mut(last), Err(SchedError::Dead(id)) if id == last));
        assert_eq!(st.dead_info(last).map(|info| info.state), Some(TaskletState::Dead));
    }
}
