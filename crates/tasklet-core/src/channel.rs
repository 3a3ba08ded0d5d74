//! Synchronous rendezvous channels between tasklets
//!
//! A send completes only when a receiver takes the value, and vice versa.
//! When a partner is already waiting the operation completes at once: the
//! partner is appended to the tail of its scheduler's run queue and the
//! caller keeps running. Otherwise the caller blocks.
//!
//! A sender may pass an error instead of a value ([`Channel::send_error`]);
//! the receiver's operation then fails with [`SchedError::Thrown`].
//!
//! Channels are not bound to a scheduler. Tasklets of schedulers on
//! different OS threads may rendezvous on the same channel; a scheduler whose
//! tasklets are all blocked needs thread blocking enabled to wait for a
//! partner on another thread.

use crate::error::{SchedError, SchedResult};
use crate::scheduler::{Handle, Waker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What travels over a channel: a value or an error for the receiver
type Payload<T> = Result<T, anyhow::Error>;

struct Receiving {
    ticket: u64,
    waker: Waker,
}

struct Sending<T> {
    ticket: u64,
    waker: Waker,
    payload: Payload<T>,
}

struct Inner<T> {
    receivers: VecDeque<Receiving>,
    senders: VecDeque<Sending<T>>,
    /// Values handed to receivers that have not resumed yet, by ticket
    delivered: FxHashMap<u64, Payload<T>>,
    next_ticket: u64,
}

impl<T> Inner<T> {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Hand `payload` to the longest-waiting receiver
    fn offer(&mut self, payload: Payload<T>) -> Result<Waker, Payload<T>> {
        match self.receivers.pop_front() {
            Some(receiver) => {
                self.delivered.insert(receiver.ticket, payload);
                Ok(receiver.waker)
            }
            None => Err(payload),
        }
    }

    /// Take the payload of the longest-waiting sender
    fn accept(&mut self) -> Option<(Payload<T>, Waker)> {
        self.senders
            .pop_front()
            .map(|sender| (sender.payload, sender.waker))
    }
}

/// Synchronous channel carrying values of type `T`
pub struct Channel<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T> {
    /// Create a channel with nobody waiting
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                receivers: VecDeque::new(),
                senders: VecDeque::new(),
                delivered: FxHashMap::default(),
                next_ticket: 0,
            })),
        }
    }

    /// Waiting senders minus waiting receivers
    pub fn balance(&self) -> isize {
        let inner = self.inner.lock();
        inner.senders.len() as isize - inner.receivers.len() as isize
    }

    /// Send without blocking. Hands the value back if no receiver waits.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        let Some(receiver) = inner.receivers.pop_front() else {
            return Err(value);
        };
        inner.delivered.insert(receiver.ticket, Ok(value));
        drop(inner);
        receiver.waker.wake();
        Ok(())
    }

    /// Receive without blocking, if a sender waits. The sender may have
    /// passed an error instead of a value.
    pub fn try_receive(&self) -> Option<SchedResult<T>> {
        let (payload, waker) = self.inner.lock().accept()?;
        waker.wake();
        Some(payload.map_err(SchedError::Thrown))
    }

    /// Send `value`, blocking the current tasklet of `handle` until a
    /// receiver takes it
    pub fn send(&self, handle: &Handle, value: T) -> SchedResult<()> {
        self.transfer(handle, Ok(value))
    }

    /// Send an error: the receiver that takes it fails with
    /// [`SchedError::Thrown`]. Blocks like [`Channel::send`].
    pub fn send_error(&self, handle: &Handle, err: impl Into<anyhow::Error>) -> SchedResult<()> {
        self.transfer(handle, Err(err.into()))
    }

    fn transfer(&self, handle: &Handle, payload: Payload<T>) -> SchedResult<()> {
        let offered = self.inner.lock().offer(payload);
        let payload = match offered {
            Ok(receiver) => {
                receiver.wake();
                return Ok(());
            }
            Err(payload) => payload,
        };

        let (waker, block_trap) = handle.prepare_block()?;
        if block_trap {
            return Err(SchedError::BlockTrap);
        }

        let ticket = {
            let mut inner = self.inner.lock();
            match inner.offer(payload) {
                Ok(receiver) => {
                    drop(inner);
                    receiver.wake();
                    return Ok(());
                }
                Err(payload) => {
                    let ticket = inner.ticket();
                    inner.senders.push_back(Sending {
                        ticket,
                        waker,
                        payload,
                    });
                    ticket
                }
            }
        };

        loop {
            let parked = handle.park();
            let mut inner = self.inner.lock();
            let waiting = inner
                .senders
                .iter()
                .position(|sender| sender.ticket == ticket);
            match (parked, waiting) {
                (Ok(()), None) => return Ok(()),
                (Ok(()), Some(_)) => continue,
                (Err(err), Some(pos)) => {
                    inner.senders.remove(pos);
                    return Err(err);
                }
                (Err(err), None) => return Err(err),
            }
        }
    }

    /// Receive a value, blocking the current tasklet of `handle` until a
    /// sender provides one
    pub fn receive(&self, handle: &Handle) -> SchedResult<T> {
        if let Some(received) = self.try_receive() {
            return received;
        }

        let (waker, block_trap) = handle.prepare_block()?;
        if block_trap {
            return Err(SchedError::BlockTrap);
        }

        let ticket = {
            let mut inner = self.inner.lock();
            if let Some((payload, sender)) = inner.accept() {
                drop(inner);
                sender.wake();
                return payload.map_err(SchedError::Thrown);
            }
            let ticket = inner.ticket();
            inner.receivers.push_back(Receiving { ticket, waker });
            ticket
        };

        loop {
            let parked = handle.park();
            let mut inner = self.inner.lock();
            if let Some(payload) = inner.delivered.remove(&ticket) {
                return match parked {
                    Ok(()) => payload.map_err(SchedError::Thrown),
                    Err(err) => {
                        debug!(error = %err, "dropping payload delivered to a failed receiver");
                        Err(err)
                    }
                };
            }
            let waiting = inner
                .receivers
                .iter()
                .position(|receiver| receiver.ticket == ticket);
            match (parked, waiting) {
                (Ok(()), Some(_)) => continue,
                (Ok(()), None) => {
                    return Err(SchedError::InvalidOperation(
                        "receiver resumed without a value",
                    ))
                }
                (Err(err), Some(pos)) => {
                    inner.receivers.remove(pos);
                    return Err(err);
                }
                (Err(err), None) => return Err(err),
            }
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Channel")
            .field("senders", &inner.senders.len())
            .field("receivers", &inner.receivers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_ops_without_partner() {
        let ch: Channel<u32> = Channel::new();
        assert_eq!(ch.try_send(5), Err(5));
        assert!(ch.try_receive().is_none());
        assert_eq!(ch.balance(), 0);
    }

    #[test]
    fn test_tickets_are_unique() {
        let ch: Channel<u32> = Channel::new();
        let mut inner = ch.inner.lock();
        let a = inner.ticket();
        let b = inner.ticket();
        assert_ne!(a, b);
    }
}
