//! Close-aware reference counting for a `Backend`.
//!
//! `CloseWaitCounter` is the thing that makes `Backend::close` race-free: it
//! is a wait-group that stops admitting new work the moment `close_wait`
//! starts, and that `close_wait` blocks on until every outstanding unit of
//! work (transaction, iterator, direct operation) has called back in via a
//! `Releaser`.
//!
//! Conceptually this is a `RWMutex` + `WaitGroup` pair: `add` takes the read
//! side (many concurrent adds), `close_wait` takes the write side once
//! (seal, then drain). A single `Mutex<State>` plus a `Condvar` expresses
//! that directly -- there is no concurrent-reads hot path here worth a real
//! `RwLock`, since `add` only touches a counter for the duration of an
//! increment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{CResult, Error};

#[derive(Default)]
struct State {
    count: u64,
    closed: bool,
}

/// A close-aware wait-group. Shared via `Arc` between a `Backend` and every
/// transaction/iterator it has handed out.
pub struct CloseWaitCounter {
    state: Mutex<State>,
    drained: Condvar,
}

impl CloseWaitCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(State::default()), drained: Condvar::new() })
    }

    /// Registers `n` units of outstanding work. Fails with `Error::Closed` if
    /// `close_wait` has already sealed the counter -- this is the mechanism
    /// by which new transactions/iterators are rejected after `close()`.
    pub fn add(&self, n: u64) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        state.count += n;
        Ok(())
    }

    /// Releases `n` units of work, waking `close_wait` if the count has
    /// drained to zero.
    fn done(&self, n: u64) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.count >= n, "CloseWaitCounter underflow");
        state.count = state.count.saturating_sub(n);
        if state.count == 0 {
            self.drained.notify_all();
        }
    }

    /// Seals the counter against further `add`s, then blocks until every
    /// previously-admitted unit of work has called `done`.
    pub fn close_wait(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        while state.count > 0 {
            state = self.drained.wait(state).unwrap();
        }
    }

    pub(crate) fn outstanding(&self) -> u64 {
        self.state.lock().unwrap().count
    }
}

/// A one-shot, idempotent decrement token for a [`CloseWaitCounter`].
///
/// Calling `release()` more than once -- from both a deferred cleanup path
/// and an explicit success path -- decrements the counter exactly once.
/// Dropping a `Releaser` without having called
/// `release()` also releases it, so a panic mid-transaction cannot leak an
/// outstanding unit and wedge a future `close()`.
pub struct Releaser {
    counter: Arc<CloseWaitCounter>,
    units: u64,
    fired: AtomicBool,
}

impl Releaser {
    pub fn new(counter: Arc<CloseWaitCounter>, units: u64) -> Self {
        Self { counter, units, fired: AtomicBool::new(false) }
    }

    pub fn release(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.counter.done(self.units);
        }
    }
}

impl Drop for Releaser {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_after_close_fails() {
        let counter = CloseWaitCounter::new();
        counter.close_wait();
        assert!(matches!(counter.add(1), Err(Error::Closed)));
    }

    #[test]
    fn release_is_idempotent() {
        let counter = CloseWaitCounter::new();
        counter.add(1).unwrap();
        let releaser = Releaser::new(counter.clone(), 1);
        releaser.release();
        releaser.release();
        releaser.release();
        assert_eq!(counter.outstanding(), 0);
    }

    #[test]
    fn drop_releases_exactly_once_after_explicit_release() {
        let counter = CloseWaitCounter::new();
        counter.add(1).unwrap();
        let releaser = Releaser::new(counter.clone(), 1);
        releaser.release();
        drop(releaser);
        assert_eq!(counter.outstanding(), 0);
    }

    #[test]
    fn close_wait_blocks_until_all_releasers_fire() {
        let counter = CloseWaitCounter::new();
        counter.add(3).unwrap();
        let r1 = Releaser::new(counter.clone(), 1);
        let r2 = Releaser::new(counter.clone(), 1);
        let r3 = Releaser::new(counter.clone(), 1);

        let closer_counter = counter.clone();
        let handle = std::thread::spawn(move || {
            closer_counter.close_wait();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        r1.release();
        r2.release();
        r3.release();

        handle.join().unwrap();
        assert_eq!(counter.outstanding(), 0);
    }

    #[test]
    fn two_releasers_per_transaction_both_must_fire() {
        // A write transaction holds two releasers: add(2) up front, two
        // independent Releaser handles, each firing once.
        let counter = CloseWaitCounter::new();
        counter.add(2).unwrap();
        let snapshot_releaser = Releaser::new(counter.clone(), 1);
        let batch_releaser = Releaser::new(counter.clone(), 1);

        snapshot_releaser.release();
        assert_eq!(counter.outstanding(), 1);
        batch_releaser.release();
        assert_eq!(counter.outstanding(), 0);
    }
}
