//! Tick-based soft-interrupt watchdog
//!
//! The watchdog counts scheduler ticks down from `interval`. When the count
//! reaches zero the interrupt hook is offered the running tasklet and may
//! elect to preempt it. Completed switches restart the countdown, so only a
//! tasklet that keeps the stack for a whole interval is ever offered.

use crate::tasklet::TaskletId;
use std::fmt;
use std::sync::Arc;

/// Interrupt hook: receives the running tasklet, returns true to preempt it
pub type InterruptHook = Arc<dyn Fn(TaskletId) -> bool + Send + Sync>;

/// Result of one watchdog step
pub(crate) enum Tick {
    /// Nothing to do
    Idle,
    /// Countdown expired inside an atomic region; retried on the next tick
    Deferred,
    /// Countdown expired; ask the hook
    Fire(InterruptHook),
}

/// Countdown state of a scheduler's watchdog
pub(crate) struct Watchdog {
    ticker: i64,
    interval: u32,
    interrupt: Option<InterruptHook>,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self {
            ticker: 0,
            interval: 0,
            interrupt: None,
        }
    }

    /// Change the interval, keeping any installed hook
    pub(crate) fn set_interval(&mut self, interval: u32) {
        self.interval = interval;
        self.reset();
    }

    /// Install the interrupt policy and restart the countdown
    pub(crate) fn set(&mut self, interval: u32, hook: InterruptHook) {
        self.interval = interval;
        self.interrupt = Some(hook);
        self.reset();
    }

    /// Remove the interrupt policy
    pub(crate) fn clear(&mut self) {
        self.interval = 0;
        self.interrupt = None;
        self.ticker = 0;
    }

    /// Restart the countdown; called after every completed switch
    pub(crate) fn reset(&mut self) {
        self.ticker = i64::from(self.interval);
    }

    pub(crate) fn ticker(&self) -> i64 {
        self.ticker
    }

    pub(crate) fn interval(&self) -> u32 {
        self.interval
    }

    /// Advance the countdown by one tick
    pub(crate) fn tick(&mut self, atomic: bool, suppressed: bool) -> Tick {
        if self.interval == 0 || suppressed {
            return Tick::Idle;
        }
        let Some(hook) = self.interrupt.as_ref() else {
            return Tick::Idle;
        };

        self.ticker -= 1;
        if self.ticker > 0 {
            return Tick::Idle;
        }
        if atomic {
            self.ticker = 0;
            return Tick::Deferred;
        }

        let hook = hook.clone();
        self.reset();
        Tick::Fire(hook)
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("ticker", &self.ticker)
            .field("interval", &self.interval)
            .field("interrupt", &self.interrupt.is_some())
            .finish()
    }
}
