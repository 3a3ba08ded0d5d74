//! Execution stubs and the stack-switch capability
//!
//! A stub is a stack region plus its saved context. The scheduler never
//! touches stacks directly: it asks the [`StubManager`] to clone a stub from
//! the blueprint ([`StubManager::create`]) and to prepare a switch to one
//! ([`StubManager::prepare_switch`]), then performs the returned
//! [`Transfer`] once it has released its own locks.
//!
//! All stubs of a scheduler run on the scheduler's OS thread.

pub(crate) mod context;

pub(crate) use context::{Entry, Request, Resume, Suspender};

use crate::error::{Invariant, SchedError, SchedResult};
use context::{Context, Step};
use parking_lot::MappedMutexGuard;
use rustc_hash::FxHashMap;
use std::fmt;
use std::io;
use std::thread::{self, ThreadId};
use tracing::{error, trace, warn};

/// Identity of a stub: the serial it was created with
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StubId(u64);

impl StubId {
    /// Serial number of this stub
    pub fn serial(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_serial(serial: u64) -> Self {
        StubId(serial)
    }
}

impl fmt::Display for StubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stub-{}", self.0)
    }
}

/// Template every new stub is cloned from
#[derive(Debug, Clone)]
pub(crate) struct Blueprint {
    pub(crate) stack_size: usize,
}

#[derive(Default)]
struct Stub {
    /// Saved context; `None` for the main stub and while the stub runs
    context: Option<Context>,
    /// Set by the stub itself once it has started
    suspender: Option<Suspender>,
}

/// Stack the departing code is running on
#[derive(Clone, Copy)]
enum Origin {
    /// The scheduler thread's own stack
    Root,
    /// A stub cloned from the blueprint
    Stub(Suspender),
}

/// A prepared, not yet performed, stack switch
#[must_use = "a transfer does nothing until performed"]
pub(crate) struct Transfer {
    from: Origin,
    to: StubId,
    signal: Resume,
}

impl Transfer {
    fn request(&self) -> Request {
        Request {
            to: self.to,
            signal: self.signal,
        }
    }

    /// The request a finishing stub returns instead of suspending
    pub(crate) fn into_request(self) -> Request {
        self.request()
    }

    /// Resume the target, suspending the calling stack until it is resumed
    /// in turn. Returns the signal it was resumed with.
    ///
    /// On the root stack this runs the dispatch loop; `stubs` gives it the
    /// manager whenever it needs to take out or put back a context.
    pub(crate) fn perform<'a, F>(self, stubs: F) -> SchedResult<Resume>
    where
        F: Fn() -> MappedMutexGuard<'a, StubManager>,
    {
        match self.from {
            Origin::Stub(suspender) => Ok(suspender.suspend(self.request())),
            Origin::Root => dispatch(self.request(), stubs),
        }
    }
}

/// Resume stubs on the root stack until one asks for the main stub
fn dispatch<'a, F>(mut request: Request, stubs: F) -> SchedResult<Resume>
where
    F: Fn() -> MappedMutexGuard<'a, StubManager>,
{
    loop {
        let context = {
            let mut manager = stubs();
            if manager.tealet_main == Some(request.to) {
                return Ok(request.signal);
            }
            manager
                .stubs
                .get_mut(&request.to)
                .and_then(|stub| stub.context.take())
        };
        let Some(mut context) = context else {
            error!(stub = %request.to, "no saved context to resume");
            return Err(SchedError::InvalidOperation("switch to a stub without a context"));
        };

        let from = request.to;
        request = match context.resume(request.signal) {
            Step::Suspended(next) => {
                stubs().restore(from, context);
                next
            }
            Step::Finished(next) => {
                drop(context);
                trace!(stub = %from, "stub stack released");
                next
            }
        };
    }
}

/// Drop a context whose stub is gone, unless that would unwind its stack
fn release(id: StubId, context: Context) {
    if context.is_suspended() {
        error!(stub = %id, "leaking the stack of a suspended stub");
        std::mem::forget(context);
    }
}

/// Owner of a scheduler's stubs
pub(crate) struct StubManager {
    initial_stub: Option<Blueprint>,
    tealet_main: Option<StubId>,
    owner: Option<ThreadId>,
    serial: u64,
    serial_last_jump: u64,
    switch_trap: i32,
    stubs: FxHashMap<StubId, Stub>,
    active: Option<StubId>,
}

impl StubManager {
    pub(crate) fn new() -> Self {
        Self {
            initial_stub: None,
            tealet_main: None,
            owner: None,
            serial: 0,
            serial_last_jump: 0,
            switch_trap: 0,
            stubs: FxHashMap::default(),
            active: None,
        }
    }

    /// Create the blueprint if it does not exist yet
    pub(crate) fn ensure_blueprint(&mut self, stack_size: usize) {
        if self.initial_stub.is_none() {
            self.initial_stub = Some(Blueprint { stack_size });
        }
    }

    /// Release the blueprint; later `create` calls fail
    pub(crate) fn release_blueprint(&mut self) -> Option<Blueprint> {
        self.initial_stub.take()
    }

    /// Adopt the calling OS thread's stack as the main stub.
    ///
    /// The main stub is not cloned from the blueprint, so it takes the
    /// current serial without advancing it.
    pub(crate) fn adopt_current(&mut self) -> StubId {
        if let Some(main) = self.tealet_main {
            return main;
        }
        let id = StubId(self.serial);
        self.stubs.insert(id, Stub::default());
        self.tealet_main = Some(id);
        self.owner = Some(thread::current().id());
        self.active = Some(id);
        self.serial_last_jump = id.0;
        id
    }

    /// Clone a new stub from the blueprint. `serial` advances only on success.
    pub(crate) fn create(&mut self, entry: Entry) -> io::Result<StubId> {
        let blueprint = self
            .initial_stub
            .as_ref()
            .ok_or_else(|| io::Error::other("stub blueprint has been released"))?;
        let context = Context::new(blueprint.stack_size, entry)?;

        self.serial += 1;
        let id = StubId(self.serial);
        self.stubs.insert(
            id,
            Stub {
                context: Some(context),
                suspender: None,
            },
        );
        trace!(serial = self.serial, "stub created");
        Ok(id)
    }

    /// Record how a started stub suspends itself
    pub(crate) fn bind(&mut self, id: StubId, suspender: Suspender) {
        if let Some(stub) = self.stubs.get_mut(&id) {
            stub.suspender = Some(suspender);
        }
    }

    /// Plan a switch from the active stub to `target`.
    ///
    /// Fails without changing anything while the switch trap is set.
    pub(crate) fn prepare_switch(&mut self, target: StubId, signal: Resume) -> SchedResult<Transfer> {
        if self.switch_trap != 0 {
            return Err(Invariant::SwitchTrapped.into());
        }
        if !self.stubs.contains_key(&target) {
            return Err(SchedError::InvalidOperation("switch to a released stub"));
        }
        let from = match self.active {
            Some(active) if Some(active) != self.tealet_main => self
                .stubs
                .get(&active)
                .and_then(|stub| stub.suspender)
                .map(Origin::Stub)
                .ok_or(SchedError::InvalidOperation("active stub has not started"))?,
            _ => Origin::Root,
        };

        self.active = Some(target);
        self.serial_last_jump = target.0;
        Ok(Transfer {
            from,
            to: target,
            signal,
        })
    }

    /// Forget a stub whose tasklet has finished. Its stack is released by
    /// the dispatch loop once control has left it.
    pub(crate) fn retire(&mut self, id: StubId) {
        if let Some(context) = self.stubs.remove(&id).and_then(|stub| stub.context) {
            release(id, context);
        }
    }

    fn restore(&mut self, id: StubId, context: Context) {
        match self.stubs.get_mut(&id) {
            Some(stub) => stub.context = Some(context),
            None => release(id, context),
        }
    }

    /// Request that hands the thread back to the main stub
    pub(crate) fn main_request(&self) -> Request {
        Request {
            to: self.tealet_main.unwrap_or(StubId(0)),
            signal: Resume::Continue,
        }
    }

    /// True if the calling OS thread is the one the stubs run on, or no
    /// thread has been adopted yet
    pub(crate) fn on_owner_thread(&self) -> bool {
        self.owner.map_or(true, |owner| owner == thread::current().id())
    }

    pub(crate) fn check_thread(&self) -> SchedResult<()> {
        if self.on_owner_thread() {
            Ok(())
        } else {
            Err(Invariant::ForeignThread.into())
        }
    }

    /// Number of stubs cloned from the blueprint that are still alive
    fn live(&self) -> usize {
        self.stubs.len() - usize::from(self.tealet_main.is_some())
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self, id: StubId) -> bool {
        self.stubs.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn has_blueprint(&self) -> bool {
        self.initial_stub.is_some()
    }

    #[cfg(test)]
    pub(crate) fn tealet_main(&self) -> Option<StubId> {
        self.tealet_main
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> Option<StubId> {
        self.active
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn serial_last_jump(&self) -> u64 {
        self.serial_last_jump
    }

    pub(crate) fn switch_trap(&self) -> i32 {
        self.switch_trap
    }

    /// Adjust the switch trap and return the new level
    pub(crate) fn adjust_switch_trap(&mut self, delta: i32) -> i32 {
        self.switch_trap += delta;
        self.switch_trap
    }

    pub(crate) fn reset_switch_trap(&mut self) {
        self.switch_trap = 0;
    }
}

impl Drop for StubManager {
    fn drop(&mut self) {
        let suspended = self
            .stubs
            .values()
            .filter(|stub| stub.context.as_ref().is_some_and(Context::is_suspended))
            .count();
        if suspended > 0 {
            warn!(suspended, "stub manager dropped with suspended stubs");
        }
        for (id, stub) in self.stubs.drain() {
            if let Some(context) = stub.context {
                release(id, context);
            }
        }
    }
}

impl fmt::Debug for StubManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubManager")
            .field("initial_stub", &self.initial_stub)
            .field("tealet_main", &self.tealet_main)
            .field("serial", &self.serial)
            .field("serial_last_jump", &self.serial_last_jump)
            .field("switch_trap", &self.switch_trap)
            .field("live", &self.live())
            .field("active", &self.active)
            .finish()
    }
}
