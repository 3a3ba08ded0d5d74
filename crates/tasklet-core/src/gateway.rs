//! Thread blocking gateway
//!
//! When every live tasklet of a scheduler is blocked and thread blocking is
//! enabled, the active stack parks its OS thread on the block primitive
//! instead of reporting a deadlock. A waker on another thread releases the
//! primitive once it has made a tasklet runnable again.

use crate::error::Invariant;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::trace;

/// Binary semaphore the scheduler thread parks on
#[derive(Debug, Default)]
pub struct ThreadBlock {
    released: Mutex<bool>,
    cv: Condvar,
}

impl ThreadBlock {
    /// Create an unreleased primitive
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until released, consuming the release
    pub fn acquire(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cv.wait(&mut released);
        }
        *released = false;
    }

    /// Release one parked (or the next) acquirer
    pub fn release(&self) -> Result<(), Invariant> {
        let mut released = self.released.lock();
        if *released {
            debug_assert!(false, "thread block released twice");
            return Err(Invariant::BlockReleasedTwice);
        }
        *released = true;
        self.cv.notify_one();
        Ok(())
    }
}

/// Per-scheduler gateway state, guarded by the scheduler lock
#[derive(Debug, Default)]
pub(crate) struct Gateway {
    block_lock: Option<Arc<ThreadBlock>>,
    is_blocked: bool,
}

impl Gateway {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn is_blocked(&self) -> bool {
        self.is_blocked
    }

    /// Mark the thread as blocked and hand out the primitive to park on.
    ///
    /// The caller must drop the scheduler lock before acquiring it.
    pub(crate) fn prepare_park(&mut self) -> Arc<ThreadBlock> {
        self.is_blocked = true;
        self.block_lock
            .get_or_insert_with(|| Arc::new(ThreadBlock::new()))
            .clone()
    }

    /// Release the parked thread. Fails if nobody is parked.
    pub(crate) fn release(&mut self) -> Result<(), Invariant> {
        if !self.is_blocked {
            debug_assert!(false, "thread block released without acquire");
            return Err(Invariant::BlockReleasedWithoutAcquire);
        }
        self.is_blocked = false;
        match &self.block_lock {
            Some(block) => block.release(),
            None => Err(Invariant::BlockReleasedWithoutAcquire),
        }
    }

    /// Release the parked thread if there is one. Returns true if it did.
    pub(crate) fn wake(&mut self) -> bool {
        if !self.is_blocked {
            return false;
        }
        trace!("releasing blocked scheduler thread");
        self.release().is_ok()
    }

    /// Drop the primitive; a later park creates a fresh one
    pub(crate) fn discard(&mut self) -> Option<Arc<ThreadBlock>> {
        self.is_blocked = false;
        self.block_lock.take()
    }
}
