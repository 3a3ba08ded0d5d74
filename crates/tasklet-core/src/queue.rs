//! Circular run queue of scheduled tasklets
//!
//! The queue is a doubly-linked ring over tasklet identities. Links live in
//! the queue itself, so unlinking an arbitrary tasklet is O(1) and the queue
//! never owns the tasklets it orders.

use crate::tasklet::TaskletId;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: TaskletId,
    next: TaskletId,
}

/// FIFO ring of tasklet identities with an exact element count
#[derive(Debug, Default)]
pub struct RunQueue {
    links: FxHashMap<TaskletId, Link>,
    head: Option<TaskletId>,
    runcount: usize,
}

impl RunQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of linked tasklets
    pub fn runcount(&self) -> usize {
        debug_assert_eq!(self.runcount, self.links.len());
        self.runcount
    }

    /// True if nothing is linked
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// True if `id` is linked
    pub fn contains(&self, id: TaskletId) -> bool {
        self.links.contains_key(&id)
    }

    /// Tasklet that would be selected next
    pub fn head(&self) -> Option<TaskletId> {
        self.head
    }

    /// Link `id` at the tail. Returns false if it was already linked.
    pub fn push_back(&mut self, id: TaskletId) -> bool {
        if self.links.contains_key(&id) {
            return false;
        }

        match self.head {
            None => {
                self.links.insert(id, Link { prev: id, next: id });
                self.head = Some(id);
            }
            Some(head) => {
                let tail = self.links[&head].prev;
                self.links.insert(id, Link { prev: tail, next: head });
                if let Some(link) = self.links.get_mut(&tail) {
                    link.next = id;
                }
                if let Some(link) = self.links.get_mut(&head) {
                    link.prev = id;
                }
            }
        }

        self.runcount += 1;
        true
    }

    /// Link `id` at the head so it is selected next
    pub fn push_front(&mut self, id: TaskletId) -> bool {
        if !self.push_back(id) {
            return false;
        }
        // The ring is circular: the new tail becomes the head by rotation.
        self.head = Some(id);
        true
    }

    /// Unlink and return the head
    pub fn pop_front(&mut self) -> Option<TaskletId> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    /// Unlink `id` wherever it is. Returns false if it was not linked.
    pub fn remove(&mut self, id: TaskletId) -> bool {
        let Some(link) = self.links.remove(&id) else {
            return false;
        };
        self.runcount -= 1;

        if link.next == id {
            self.head = None;
            return true;
        }

        if let Some(prev) = self.links.get_mut(&link.prev) {
            prev.next = link.next;
        }
        if let Some(next) = self.links.get_mut(&link.next) {
            next.prev = link.prev;
        }
        if self.head == Some(id) {
            self.head = Some(link.next);
        }
        true
    }

    /// Iterate from head to tail
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            queue: self,
            cursor: self.head,
            remaining: self.runcount,
        }
    }

    /// Snapshot of the queue order
    pub fn order(&self) -> Vec<TaskletId> {
        self.iter().collect()
    }

    /// Unlink everything
    pub fn clear(&mut self) {
        self.links.clear();
        self.head = None;
        self.runcount = 0;
    }
}

/// Head-to-tail iterator over a [`RunQueue`]
pub struct Iter<'a> {
    queue: &'a RunQueue,
    cursor: Option<TaskletId>,
    remaining: usize,
}

impl Iterator for Iter<'_> {
    type Item = TaskletId;

    fn next(&mut self) -> Option<TaskletId> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.cursor?;
        self.remaining -= 1;
        self.cursor = self.queue.links.get(&id).map(|link| link.next);
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
