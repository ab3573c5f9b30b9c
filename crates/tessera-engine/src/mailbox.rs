//! Actor mailboxes.
//!
//! A bounded multi-producer/single-consumer queue with a
//! rotate-and-continue overflow policy: sending into a full mailbox
//! evicts the oldest queued item to admit the new one, and never
//! blocks the sender. An actor therefore suspends only on its own
//! receive (or a store future) — never on a peer's backlog — and a
//! backed-up shard cannot stall the actors feeding it. Rotation loss
//! is repaired by the protocol's repeating senders.
//!
//! Closing (explicitly, or by dropping the receiver) makes further
//! sends return false; the receiver drains what is queued, then
//! observes the close.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    rotated: u64,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    name: String,
    capacity: usize,
}

/// The sending half. Cloning shares the queue.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The owning (receive) half. Dropping it closes the mailbox.
pub struct MailboxReceiver<T> {
    inner: Arc<Inner<T>>,
}

/// Result of a non-blocking receive.
pub enum TryRecv<T> {
    Item(T),
    Empty,
    Closed,
}

/// Result of a bounded-wait receive.
pub enum RecvTimeout<T> {
    Item(T),
    Timeout,
    Closed,
}

impl<T> Mailbox<T> {
    /// Creates a mailbox of `capacity` items. The name labels rotation
    /// warnings.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Mailbox<T>, MailboxReceiver<T>) {
        debug_assert!(capacity > 0, "mailbox needs capacity");
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                rotated: 0,
            }),
            available: Condvar::new(),
            name: name.into(),
            capacity,
        });
        (
            Mailbox {
                inner: inner.clone(),
            },
            MailboxReceiver { inner },
        )
    }

    /// Enqueues `item`, rotating the oldest queued item out if the
    /// mailbox is full. Never blocks. Returns false iff the mailbox is
    /// closed (the item is then dropped).
    pub fn send(&self, item: T) -> bool {
        let mut state = self.inner.state.lock().expect("mailbox lock");
        if state.closed {
            return false;
        }
        if state.queue.len() == self.inner.capacity {
            state.queue.pop_front();
            state.rotated += 1;
            warn!(
                mailbox = %self.inner.name,
                rotated = state.rotated,
                "mailbox full; rotating oldest item out"
            );
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.available.notify_one();
        true
    }

    /// Closes the mailbox: further sends fail, the receiver drains what
    /// remains and then observes the close.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("mailbox lock");
        state.closed = true;
        drop(state);
        self.inner.available.notify_all();
    }
}

impl<T> MailboxReceiver<T> {
    /// Blocks until an item arrives; `None` once closed and drained.
    pub fn recv(&self) -> Option<T> {
        let mut state = self.inner.state.lock().expect("mailbox lock");
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.inner.available.wait(state).expect("mailbox lock");
        }
    }

    pub fn try_recv(&self) -> TryRecv<T> {
        let mut state = self.inner.state.lock().expect("mailbox lock");
        match state.queue.pop_front() {
            Some(item) => TryRecv::Item(item),
            None if state.closed => TryRecv::Closed,
            None => TryRecv::Empty,
        }
    }

    /// Waits up to `timeout` for an item.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvTimeout<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().expect("mailbox lock");
        loop {
            if let Some(item) = state.queue.pop_front() {
                return RecvTimeout::Item(item);
            }
            if state.closed {
                return RecvTimeout::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return RecvTimeout::Timeout;
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .expect("mailbox lock");
            state = guard;
        }
    }
}

impl<T> Drop for MailboxReceiver<T> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.closed = true;
        }
        self.inner.available.notify_all();
    }
}
