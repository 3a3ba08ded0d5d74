//! Performing switches and running tasklet bodies on their stubs

use super::state::{Departure, Plan, Selection, SchedulerState};
use super::{Handle, SchedLockGuard};
use crate::error::{self, SchedError, SchedResult};
use crate::stub::{Request, Resume, Suspender, Transfer};
use crate::tasklet::{Exit, TaskletId};
use parking_lot::MutexGuard;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Boxed tasklet body
pub(crate) type Body = Box<dyn FnOnce(&Handle) -> anyhow::Result<()> + Send>;

impl Handle {
    /// Give up the current stack according to `dep`.
    ///
    /// Returns once the departing tasklet runs again: true if it was
    /// switched away, false if no switch was needed.
    pub(crate) fn depart(&self, dep: Departure) -> SchedResult<bool> {
        let Some(transfer) = self.leave_stack(dep)? else {
            return Ok(false);
        };
        let signal =
            transfer.perform(|| MutexGuard::map(self.shared.state.lock(), |st| &mut st.stubs))?;
        self.resumed(signal)?;
        Ok(true)
    }

    /// Plan and commit a departure, running the schedule callback. Returns
    /// the transfer to perform, or `None` if the caller keeps its stack.
    fn leave_stack(&self, dep: Departure) -> SchedResult<Option<Transfer>> {
        let (plan, hook) = {
            let mut st = self.lock_initialized()?;
            let me = st.check_switching(&dep)?;
            st.schedlock += 1;
            match Self::plan(&mut st, me, dep) {
                Ok(plan) => (plan, st.schedule_hook.clone()),
                Err(err) => {
                    st.schedlock -= 1;
                    return Err(err);
                }
            }
        };

        let _guard = SchedLockGuard {
            shared: &self.shared,
        };
        match plan {
            Plan::Stay => Ok(None),
            Plan::Switch {
                prev,
                next,
                transfer,
            } => {
                if let Some(hook) = hook {
                    if panic::catch_unwind(AssertUnwindSafe(|| hook(prev, next))).is_err() {
                        error!(prev = %prev, next = %next, "schedule callback panicked");
                    }
                }
                Ok(Some(transfer))
            }
        }
    }

    /// Apply, select and commit under the lock, parking the OS thread while
    /// every live tasklet is blocked
    fn plan(
        st: &mut MutexGuard<'_, SchedulerState>,
        me: TaskletId,
        dep: Departure,
    ) -> SchedResult<Plan> {
        if !st.leave(me, &dep)? {
            return Ok(Plan::Stay);
        }
        loop {
            match st.select(me, &dep)? {
                #[cfg(feature = "thread-block")]
                Selection::Park(block) => {
                    MutexGuard::unlocked(st, || block.acquire());
                }
                selection => return st.commit(me, dep, selection),
            }
        }
    }

    /// Bookkeeping every stack does first thing after it has been resumed
    fn resumed(&self, signal: Resume) -> SchedResult<()> {
        let (batch, pending) = {
            let mut st = self.shared.state.lock();
            let batch = st.del_post_switch.take();
            let current = st.current;
            let pending = current
                .and_then(|me| st.tasklets.get_mut(&me))
                .and_then(|t| t.pending_error.take());
            (batch, pending)
        };
        batch.run();

        if signal == Resume::Unwind {
            return Err(SchedError::TaskletExit);
        }
        match pending {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Entry point of every spawned stub. Returns the stub to hand the
    /// thread to once the tasklet is over.
    pub(crate) fn tasklet_main(
        self,
        id: TaskletId,
        suspender: Suspender,
        signal: Resume,
        body: Body,
    ) -> Request {
        let preset = self.start(id, suspender, signal);
        let exit = match signal {
            Resume::Unwind => {
                drop(body);
                Exit::Killed
            }
            Resume::Continue => self.execute(id, body, preset),
        };
        self.finish(id, exit)
    }

    /// Bind the stub, mark the tasklet started and take an error thrown
    /// into it before it ran
    fn start(&self, id: TaskletId, suspender: Suspender, signal: Resume) -> Option<SchedError> {
        let (batch, preset) = {
            let mut st = self.shared.state.lock();
            let stub = st.tasklets.get(&id).and_then(|t| t.stub);
            if let Some(stub) = stub {
                st.stubs.bind(stub, suspender);
            }
            let preset = st.tasklets.get_mut(&id).and_then(|t| {
                t.started = signal == Resume::Continue;
                t.pending_error.take()
            });
            (st.del_post_switch.take(), preset)
        };
        batch.run();
        preset
    }

    fn execute(&self, id: TaskletId, body: Body, preset: Option<SchedError>) -> Exit {
        let err = match preset {
            Some(SchedError::TaskletExit) => return Exit::Killed,
            Some(SchedError::Thrown(err)) => {
                debug!(tasklet = %id, error = %err, "error thrown before the body ran");
                err
            }
            Some(other) => other.into(),
            None => match panic::catch_unwind(AssertUnwindSafe(|| body(self))) {
                Ok(Ok(())) => return Exit::Finished,
                Ok(Err(err)) if error::is_exit(&err) => return Exit::Killed,
                Ok(Err(err)) => err,
                Err(payload) => {
                    anyhow::anyhow!("tasklet panicked: {}", panic_message(&*payload))
                }
            },
        };

        let handler = self.shared.state.lock().error_handler.clone();
        let Some(handler) = handler else {
            return Exit::Failed(failure(id, &err));
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler(id, &err))) {
            Ok(Ok(())) => {
                debug!(tasklet = %id, error = %err, "failure absorbed by error handler");
                Exit::Finished
            }
            Ok(Err(handler_err)) => Exit::Failed(failure(id, &handler_err)),
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!(tasklet = %id, %message, "error handler panicked");
                Exit::Failed(failure(id, &err))
            }
        }
    }

    /// Retire the tasklet and name its successor. The stub's stack is
    /// released once control has left it.
    fn finish(&self, id: TaskletId, exit: Exit) -> Request {
        {
            let mut st = self.shared.state.lock();
            if st.stubs.switch_trap() != 0 {
                error!(tasklet = %id, level = st.stubs.switch_trap(), "tasklet finished inside a switch trap");
                st.stubs.reset_switch_trap();
            }
        }
        match self.leave_stack(Departure::Finish(exit)) {
            Ok(Some(transfer)) => transfer.into_request(),
            Ok(None) => {
                error!(tasklet = %id, "finished tasklet was told to keep its stack");
                self.shared.state.lock().stubs.main_request()
            }
            Err(err) => {
                error!(tasklet = %id, error = %err, "finished tasklet could not hand over its stack");
                self.shared.state.lock().stubs.main_request()
            }
        }
    }
}

fn failure(id: TaskletId, err: &anyhow::Error) -> SchedError {
    SchedError::TaskletFailed {
        id,
        message: format!("{err:#}"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");

        let payload = panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 1");
    }

    #[test]
    fn test_failure_renders_chain() {
        let err = anyhow::anyhow!("inner").context("outer");
        match failure(TaskletId::from_u64(3), &err) {
            SchedError::TaskletFailed { id, message } => {
                assert_eq!(id, TaskletId::from_u64(3));
                assert_eq!(message, "outer: inner");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
