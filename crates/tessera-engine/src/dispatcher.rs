//! Executor shards.
//!
//! An [`Executor`] is a thread owning a state value `M` and a bounded
//! mailbox of jobs against it; a [`ShardedDispatcher`] fans a family of
//! executors out and routes work by sharding byte. Vars, proposers, and
//! acceptors are all pinned this way, which is what makes their state
//! machines lock-free.
//!
//! Mailboxes overflow by rotation (see [`crate::mailbox`]): enqueueing
//! never blocks the sender, so an actor only ever suspends on its own
//! receive, and a backed-up shard cannot stall the actors feeding it.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use crate::mailbox::{Mailbox, MailboxReceiver};

/// Depth of each executor's mailbox.
const MAILBOX_DEPTH: usize = 1024;

type Job<M> = Box<dyn FnOnce(&mut M) + Send>;

/// Cloneable handle for enqueueing work onto one executor.
pub struct ExecutorHandle<M> {
    mailbox: Mailbox<Job<M>>,
    name: String,
}

impl<M> Clone for ExecutorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            name: self.name.clone(),
        }
    }
}

impl<M: Send + 'static> ExecutorHandle<M> {
    /// Enqueues a job; returns false if the executor has shut down.
    ///
    /// Never blocks: a full mailbox rotates its oldest job out to admit
    /// the new one. Rotation loss is repaired by the protocol's
    /// repeating senders.
    pub fn enqueue(&self, f: impl FnOnce(&mut M) + Send + 'static) -> bool {
        self.mailbox.send(Box::new(f))
    }

    /// Runs a job after a delay, from a detached timer thread.
    pub fn enqueue_after(&self, delay: Duration, f: impl FnOnce(&mut M) + Send + 'static) {
        let this = self.clone();
        thread::Builder::new()
            .name(format!("{}-timer", self.name))
            .spawn(move || {
                thread::sleep(delay);
                this.enqueue(f);
            })
            .expect("spawn timer thread");
    }

    /// Stops the executor once its queue drains.
    pub fn shutdown(&self) {
        self.mailbox.close();
    }
}

/// One executor: a thread looping over its mailbox with exclusive
/// ownership of `M`.
pub struct Executor<M> {
    pub handle: ExecutorHandle<M>,
    pub thread: JoinHandle<M>,
}

impl<M: Send + 'static> Executor<M> {
    pub fn spawn(name: impl Into<String>, mut state: M) -> Self {
        let name = name.into();
        let (mailbox, jobs): (Mailbox<Job<M>>, MailboxReceiver<Job<M>>) =
            Mailbox::new(name.clone(), MAILBOX_DEPTH);
        let thread_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Some(job) = jobs.recv() {
                    job(&mut state);
                }
                debug!(executor = %thread_name, "executor stopped");
                state
            })
            .expect("spawn executor thread");
        Self {
            handle: ExecutorHandle { mailbox, name },
            thread,
        }
    }
}

/// A family of executors, one per shard.
///
/// Ids route by `sharding_byte % shard_count`, so everything concerning
/// one id lands on one thread.
pub struct ShardedDispatcher<M> {
    shards: Vec<Executor<M>>,
}

impl<M: Send + 'static> ShardedDispatcher<M> {
    /// Spawns `count` shards, building each state with `make_state(idx)`.
    pub fn spawn(
        name: &str,
        count: usize,
        mut make_state: impl FnMut(usize) -> M,
    ) -> Self {
        debug_assert!(count > 0, "dispatcher needs at least one shard");
        let shards = (0..count)
            .map(|idx| Executor::spawn(format!("{name}-{idx}"), make_state(idx)))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn handle_for(&self, sharding_byte: u8) -> &ExecutorHandle<M> {
        &self.shards[usize::from(sharding_byte) % self.shards.len()].handle
    }

    pub fn handles(&self) -> Vec<ExecutorHandle<M>> {
        self.shards.iter().map(|s| s.handle.clone()).collect()
    }

    /// Routes a job to the shard owning `sharding_byte`.
    pub fn with_shard(
        &self,
        sharding_byte: u8,
        f: impl FnOnce(&mut M) + Send + 'static,
    ) -> bool {
        self.handle_for(sharding_byte).enqueue(f)
    }

    /// Runs a job on every shard.
    pub fn for_each_shard(&self, f: impl Fn(&mut M) + Send + Sync + Clone + 'static) {
        for shard in &self.shards {
            let f = f.clone();
            shard.handle.enqueue(move |m| f(m));
        }
    }

    /// Stops every shard and joins, returning the final states.
    pub fn shutdown(self) -> Vec<M> {
        for shard in &self.shards {
            shard.handle.shutdown();
        }
        self.shards
            .into_iter()
            .map(|s| s.thread.join().expect("executor panicked"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn executor_owns_state() {
        let exe = Executor::spawn("test", 0u64);
        let (tx, rx) = channel();
        for _ in 0..100 {
            exe.handle.enqueue(|n| *n += 1);
        }
        exe.handle.enqueue(move |n| {
            let _ = tx.send(*n);
        });
        assert_eq!(rx.recv().expect("result"), 100);
        exe.handle.shutdown();
        assert_eq!(exe.thread.join().expect("join"), 100);
    }

    #[test]
    fn enqueue_after_shutdown_fails() {
        let exe = Executor::spawn("test", ());
        exe.handle.shutdown();
        exe.thread.join().expect("join");
        assert!(!exe.handle.enqueue(|()| {}));
    }

    #[test]
    fn dispatcher_routes_consistently() {
        let dispatcher = ShardedDispatcher::spawn("test", 4, |idx| (idx, 0usize));
        let byte = 0x37;
        for _ in 0..10 {
            dispatcher.with_shard(byte, |(_, n)| *n += 1);
        }
        let states = dispatcher.shutdown();
        let total: usize = states.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 10);
        // All work landed on the one shard the byte routes to.
        assert_eq!(states[byte as usize % 4].1, 10);
    }

    #[test]
    fn for_each_shard_touches_all() {
        let dispatcher = ShardedDispatcher::spawn("test", 3, |_| 0u32);
        dispatcher.for_each_shard(|n| *n += 1);
        let states = dispatcher.shutdown();
        assert_eq!(states, vec![1, 1, 1]);
    }

    #[test]
    fn enqueue_after_fires() {
        let exe = Executor::spawn("timer", ());
        let (tx, rx) = channel();
        exe.handle
            .enqueue_after(Duration::from_millis(5), move |()| {
                let _ = tx.send(());
            });
        rx.recv_timeout(Duration::from_secs(5)).expect("timer fired");
        exe.handle.shutdown();
        exe.thread.join().expect("join");
    }
}
