//! Deferred release list
//!
//! Values whose destruction must not run on the stack that is about to be
//! switched away from are parked here and released by the next stack to
//! resume, immediately after the switch completes.

use std::fmt;

type Release = Box<dyn FnOnce() + Send>;

/// Pending release actions, drained after every completed switch
#[derive(Default)]
pub struct DeferredReleases {
    pending: Vec<Release>,
}

impl DeferredReleases {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `value` to be dropped after the next switch
    pub fn defer<T: Send + 'static>(&mut self, value: T) {
        self.pending.push(Box::new(move || drop(value)));
    }

    /// Queue an arbitrary release action
    pub fn defer_with(&mut self, action: impl FnOnce() + Send + 'static) {
        self.pending.push(Box::new(action));
    }

    /// Number of pending actions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Unlink every pending action, leaving the list empty.
    ///
    /// The caller runs the returned batch with [`Batch::run`] once it no
    /// longer holds the scheduler lock, so a release that touches the
    /// scheduler cannot deadlock or observe a half-updated list.
    pub fn take(&mut self) -> Batch {
        Batch {
            actions: std::mem::take(&mut self.pending),
        }
    }
}

impl fmt::Debug for DeferredReleases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredReleases")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Release actions unlinked from a [`DeferredReleases`] list
#[must_use = "a batch does nothing until it is run"]
pub struct Batch {
    actions: Vec<Release>,
}

impl Batch {
    /// Number of actions in the batch
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// True if there is nothing to run
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action in the order it was deferred
    pub fn run(self) {
        for action in self.actions {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Marker(Arc<Mutex<Vec<u32>>>, u32);

    impl Drop for Marker {
        fn drop(&mut self) {
            self.0.lock().push(self.1);
        }
    }

    #[test]
    fn test_values_are_dropped_only_when_batch_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = DeferredReleases::new();
        list.defer(Marker(log.clone(), 1));
        list.defer(Marker(log.clone(), 2));
        assert_eq!(list.len(), 2);

        let batch = list.take();
        assert!(list.is_empty());
        assert_eq!(batch.len(), 2);
        assert!(log.lock().is_empty());

        batch.run();
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn test_defer_with_runs_action() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = DeferredReleases::new();
        let sink = log.clone();
        list.defer_with(move || sink.lock().push(7));
        list.take().run();
        assert_eq!(*log.lock(), vec![7]);
        assert!(list.take().is_empty());
    }
}
