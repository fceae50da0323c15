//! Bounded, explicitly closable channel
//!
//! [`Channel`] is the queue behind every named stream. Unlike a plain mpsc
//! channel it is closed explicitly (by the supervisor) rather than by dropping
//! senders, and both halves live behind the same shared handle so any number
//! of producers and consumers can hold an `Arc<Channel<T>>`.
//!
//! ## Semantics
//!
//! - Capacity `0` is a rendezvous: `send` completes only once a receiver has
//!   taken the value.
//! - Once closed, `send`/`try_send` fail immediately and hand the value back.
//!   A sender blocked at the moment of the close is woken and fails the same
//!   way; a rendezvous value that no receiver took is withdrawn.
//! - Receivers drain whatever is still buffered after a close and then see
//!   `None`.
//! - `close` is idempotent. The flag and the queue change under one mutex, so
//!   a send racing a close either lands before it or fails cleanly.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// A channel of opaque byte chunks: one line of output or one caller write
pub type Stream = Channel<Vec<u8>>;

/// Error returned by [`Channel::send`] when the channel is closed
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Recover the value that could not be sent
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("send on closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Error returned by [`Channel::try_send`]
pub enum TrySendError<T> {
    /// No room (or, for a rendezvous channel, no receiver waiting)
    Full(T),
    /// The channel has been closed
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("channel full"),
            TrySendError::Closed(_) => f.write_str("send on closed channel"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    /// Number of values ever pushed; a rendezvous sender's ticket
    pushed: u64,
    /// Number of values ever taken by receivers or withdrawn by their sender
    taken: u64,
    /// Receivers currently inside `recv`
    waiting_receivers: usize,
}

/// FIFO queue with a fixed capacity and an explicit, idempotent close
pub struct Channel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    closed: AtomicBool,
    /// Woken when a value is pushed or the channel closes
    recv_ready: Notify,
    /// Woken when a value is taken or withdrawn, or the channel closes
    send_ready: Notify,
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Channel<T> {
    /// Create a channel holding up to `capacity` values (`0` = rendezvous)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
                pushed: 0,
                taken: 0,
                waiting_receivers: 0,
            }),
            closed: AtomicBool::new(false),
            recv_ready: Notify::new(),
            send_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slots available to senders; a rendezvous parks one value at a time
    fn slots(&self) -> usize {
        self.capacity.max(1)
    }

    /// Configured capacity (`0` for a rendezvous channel)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of values currently queued
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no values are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking, eventually consistent view of the closed flag
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the channel. Calling it again is a no-op.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.closed.store(true, Ordering::Release);
        }
        self.recv_ready.notify_waiters();
        self.send_ready.notify_waiters();
    }

    /// Send a value, waiting for room (or for a receiver on a rendezvous
    /// channel) but never past a close.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        let ticket = loop {
            let notified = self.send_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(SendError(value));
                }
                if state.queue.len() < self.slots() {
                    state.queue.push_back(value);
                    state.pushed += 1;
                    let ticket = state.pushed;
                    drop(state);
                    self.recv_ready.notify_waiters();
                    break ticket;
                }
            }
            notified.await;
        };

        if self.capacity > 0 {
            return Ok(());
        }

        // Withdraws the parked value if this future is dropped before handoff.
        let _handoff = Handoff {
            channel: self,
            ticket,
        };
        loop {
            let notified = self.send_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.taken >= ticket {
                    return Ok(());
                }
                if state.closed {
                    return match withdraw(&mut state) {
                        Some(value) => Err(SendError(value)),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }

    /// Send without waiting
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(TrySendError::Closed(value));
            }
            let has_room = if self.capacity == 0 {
                state.queue.is_empty() && state.waiting_receivers > 0
            } else {
                state.queue.len() < self.capacity
            };
            if !has_room {
                return Err(TrySendError::Full(value));
            }
            state.queue.push_back(value);
            state.pushed += 1;
        }
        self.recv_ready.notify_waiters();
        Ok(())
    }

    /// Receive the next value; `None` once the channel is closed and drained
    pub async fn recv(&self) -> Option<T> {
        let _waiting = WaitingReceiver::enter(self);
        loop {
            let notified = self.recv_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(value) = self.take(&mut state) {
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Receive a value if one is ready
    pub fn try_recv(&self) -> Option<T> {
        let mut state = self.lock();
        self.take(&mut state)
    }

    fn take(&self, state: &mut State<T>) -> Option<T> {
        let value = state.queue.pop_front()?;
        state.taken += 1;
        self.send_ready.notify_waiters();
        Some(value)
    }
}

/// Take back the parked rendezvous value, settling its ticket
fn withdraw<T>(state: &mut State<T>) -> Option<T> {
    let value = state.queue.pop_front()?;
    state.taken += 1;
    Some(value)
}

struct Handoff<'a, T> {
    channel: &'a Channel<T>,
    ticket: u64,
}

impl<T> Drop for Handoff<'_, T> {
    fn drop(&mut self) {
        let mut state = self.channel.lock();
        // A rendezvous channel parks at most one value, so an untaken ticket
        // is always the front of the queue.
        if state.taken < self.ticket && withdraw(&mut state).is_some() {
            drop(state);
            self.channel.send_ready.notify_waiters();
        }
    }
}

struct WaitingReceiver<'a, T> {
    channel: &'a Channel<T>,
}

impl<'a, T> WaitingReceiver<'a, T> {
    fn enter(channel: &'a Channel<T>) -> Self {
        channel.lock().waiting_receivers += 1;
        Self { channel }
    }
}

impl<T> Drop for WaitingReceiver<'_, T> {
    fn drop(&mut self) {
        self.channel.lock().waiting_receivers -= 1;
    }
}
