//! Coroutine contexts backing execution stubs
//!
//! Every stub cloned from the blueprint is a coroutine with its own stack,
//! switched in user space on the scheduler's OS thread. The main stub is
//! that thread's own stack and acts as the root: a stub gives up its stack
//! by suspending to the root with a [`Request`] naming the stub to resume
//! next, and the root's dispatch loop resumes it in turn.

use super::StubId;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::io;
use std::ptr::NonNull;

/// Signal delivered to a stub when it is resumed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Resume {
    /// Continue where the stub left off
    Continue,
    /// Unwind the stub's tasklet
    Unwind,
}

/// The stub to resume next and what to tell it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Request {
    pub(crate) to: StubId,
    pub(crate) signal: Resume,
}

/// Body of a stub: runs until its tasklet is over, then names the stub
/// that takes over the thread
pub(crate) type Entry = Box<dyn FnOnce(Suspender, Resume) -> Request>;

/// What a resumed context did with the stack
pub(crate) enum Step {
    /// Suspended itself, asking for another stub
    Suspended(Request),
    /// Returned for good; its stack can be released
    Finished(Request),
}

/// Saved context of a stub: its stack and everything suspended on it
pub(crate) struct Context(Coroutine<Resume, Request, Request, DefaultStack>);

// SAFETY: a context is only resumed by the dispatch loop running on its
// scheduler's own thread, and a context that has started is never dropped
// before it finishes (see `StubManager`'s `Drop`). Moving the suspended
// stack between owners on that thread is all `Send` is needed for.
unsafe impl Send for Context {}

impl Context {
    /// Allocate a stack of `stack_size` bytes with `entry` ready to run on it
    pub(crate) fn new(stack_size: usize, entry: Entry) -> io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;
        let coroutine = Coroutine::with_stack(
            stack,
            move |yielder: &Yielder<Resume, Request>, signal: Resume| {
                entry(Suspender(NonNull::from(yielder)), signal)
            },
        );
        Ok(Context(coroutine))
    }

    /// Switch to this context until it suspends or finishes
    pub(crate) fn resume(&mut self, signal: Resume) -> Step {
        match self.0.resume(signal) {
            CoroutineResult::Yield(request) => Step::Suspended(request),
            CoroutineResult::Return(request) => Step::Finished(request),
        }
    }

    /// Started and not finished: dropping it would have to unwind its stack
    pub(crate) fn is_suspended(&self) -> bool {
        self.0.started() && !self.0.done()
    }
}

/// Lets code running on a stub suspend that stub
#[derive(Clone, Copy)]
pub(crate) struct Suspender(NonNull<Yielder<Resume, Request>>);

// SAFETY: only ever used on the scheduler's thread by the stub it belongs to.
unsafe impl Send for Suspender {}

impl Suspender {
    /// Suspend the calling stub with `request`; returns once it is resumed
    pub(crate) fn suspend(self, request: Request) -> Resume {
        // SAFETY: the yielder outlives the entry closure it was handed to,
        // and a suspender is only used from inside that closure while its
        // stub is the active one.
        let yielder = unsafe { self.0.as_ref() };
        yielder.suspend(request)
    }
}
