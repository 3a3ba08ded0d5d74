//! Scheduler configuration and run flags

use tracing::warn;

/// Default stack size for tasklet stubs (256 KiB)
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack size accepted for a stub (16 KiB)
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Dead tasklet records kept queryable after their stub is released
pub const DEAD_RECORDS: usize = 128;

/// Configuration for a [`Scheduler`](crate::Scheduler)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Stack size of every stub cloned from the blueprint (default: 256 KiB)
    pub stack_size: usize,
    /// Watchdog interval in ticks; 0 disables the watchdog (default: 0)
    pub interval: u32,
    /// Park the OS thread when every live tasklet is blocked (default: false)
    pub thread_block: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            interval: 0,
            thread_block: false,
        }
    }
}

impl SchedulerConfig {
    /// Default configuration overridden by `TASKLET_STACK_SIZE`,
    /// `TASKLET_INTERVAL` and `TASKLET_THREAD_BLOCK`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("TASKLET_STACK_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(size) => config.stack_size = size.max(MIN_STACK_SIZE),
                Err(_) => warn!(value = %raw, "ignoring invalid TASKLET_STACK_SIZE"),
            }
        }

        if let Some(raw) = lookup("TASKLET_INTERVAL") {
            match raw.trim().parse::<u32>() {
                Ok(interval) => config.interval = interval,
                Err(_) => warn!(value = %raw, "ignoring invalid TASKLET_INTERVAL"),
            }
        }

        if let Some(raw) = lookup("TASKLET_THREAD_BLOCK") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.thread_block = true,
                "0" | "false" | "no" | "off" => config.thread_block = false,
                _ => warn!(value = %raw, "ignoring invalid TASKLET_THREAD_BLOCK"),
            }
        }

        config
    }

    /// Set the stub stack size (clamped to [`MIN_STACK_SIZE`])
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size.max(MIN_STACK_SIZE);
        self
    }

    /// Set the watchdog interval
    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    /// Enable or disable thread blocking
    pub fn with_thread_block(mut self, enabled: bool) -> Self {
        self.thread_block = enabled;
        self
    }
}

bitflags::bitflags! {
    /// Flags controlling a single run pass
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RunFlags: u32 {
        /// Return after one tasklet has given up control
        const SINGLE_STEP           = 1 << 0;
        /// Keep running after a watchdog interrupt
        const CONTINUE_ON_INTERRUPT = 1 << 1;
        /// Park the OS thread instead of returning when everything is blocked
        const THREAD_BLOCK          = 1 << 2;
        /// Disable the watchdog for this pass
        const NO_SOFT_INTERRUPT     = 1 << 31;
    }
}

impl RunFlags {
    /// No flags: run until the queue drains or the watchdog fires
    pub const NONE: RunFlags = RunFlags::empty();
}
