//! Transaction manager: snapshot+batch fusion, checkpoint policy, and
//! commit-hook orchestration (§4.3).
//!
//! Separates a plain read `ReadTransaction` from a `WriteTransaction` that
//! wraps one, simplified for a single-writer-per-transaction,
//! non-global-sequence model: each `WriteTransaction` owns its own snapshot
//! and batch rather than sharing one write lock keyed off a transaction
//! manager, since this crate has no cross-transaction ordering to track
//! (§5: "two committed transactions are serialized by the engine" -- the
//! engine's own mutex does that serialization, not this layer).

use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crate::engine::tuning::EngineTuning;
use crate::engine::{Batch, Engine, EngineSnapshot, Op};
use crate::error::{CResult, Error};
use crate::lifecycle::{CloseWaitCounter, Releaser};

/// A user-supplied commit hook, invoked with the write transaction as its
/// sole argument immediately before a flush actually happens.
pub type Hook<E> = Box<dyn FnMut(&mut WriteTransaction<E>) -> CResult<()> + Send>;

/// A frozen-view read transaction: a snapshot plus one releaser.
pub struct ReadTransaction<E: Engine> {
    snapshot: E::Snapshot,
    counter: Arc<CloseWaitCounter>,
    releaser: Releaser,
}

impl<E: Engine> ReadTransaction<E> {
    pub(crate) fn new(snapshot: E::Snapshot, counter: &Arc<CloseWaitCounter>) -> CResult<Self> {
        counter.add(1)?;
        Ok(Self { snapshot, counter: Arc::clone(counter), releaser: Releaser::new(Arc::clone(counter), 1) })
    }

    pub fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.snapshot.get(key)
    }

    pub fn range(&self, lo: Bound<Vec<u8>>, hi: Bound<Vec<u8>>) -> CResult<TxnIterator<E::Snapshot>> {
        TxnIterator::new(self.snapshot.clone(), lo, hi, &self.counter)
    }

    pub fn prefix(&self, prefix: &[u8]) -> CResult<TxnIterator<E::Snapshot>> {
        TxnIterator::prefix(self.snapshot.clone(), prefix, &self.counter)
    }

    /// Discards the transaction. Safe to call more than once, and safe to
    /// skip (the `Releaser`'s `Drop` impl covers it).
    pub fn release(self) {
        self.releaser.release();
    }
}

/// A read-write transaction: a snapshot for reads (so it never observes its
/// own batch -- I3), a batch for buffered writes, and the checkpoint/commit
/// machinery from §4.3.
pub struct WriteTransaction<E: Engine> {
    engine: Arc<Mutex<E>>,
    snapshot: E::Snapshot,
    batch: Batch,
    hooks: Vec<Hook<E>>,
    in_flush: bool,
    tuning: EngineTuning,
    counter: Arc<CloseWaitCounter>,
    snapshot_releaser: Releaser,
    batch_releaser: Releaser,
}

impl<E: Engine> WriteTransaction<E> {
    pub(crate) fn new(
        engine: Arc<Mutex<E>>,
        snapshot: E::Snapshot,
        hooks: Vec<Hook<E>>,
        tuning: EngineTuning,
        counter: &Arc<CloseWaitCounter>,
    ) -> CResult<Self> {
        counter.add(2)?;
        Ok(Self {
            engine,
            snapshot,
            batch: Batch::new(),
            hooks,
            in_flush: false,
            tuning,
            counter: Arc::clone(counter),
            snapshot_releaser: Releaser::new(Arc::clone(counter), 1),
            batch_releaser: Releaser::new(Arc::clone(counter), 1),
        })
    }

    /// Reads through the transaction's snapshot, which was taken before this
    /// transaction's own writes -- it never observes them, even after a
    /// `checkpoint()` flush (I3).
    pub fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.snapshot.get(key)
    }

    pub fn range(&self, lo: Bound<Vec<u8>>, hi: Bound<Vec<u8>>) -> CResult<TxnIterator<E::Snapshot>> {
        TxnIterator::new(self.snapshot.clone(), lo, hi, &self.counter)
    }

    pub fn prefix(&self, prefix: &[u8]) -> CResult<TxnIterator<E::Snapshot>> {
        TxnIterator::prefix(self.snapshot.clone(), prefix, &self.counter)
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.batch.push(Op::Put(key.to_vec(), value));
        self.flush_if_hard_threshold_reached()
    }

    pub fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.batch.push(Op::Delete(key.to_vec()));
        self.flush_if_hard_threshold_reached()
    }

    /// The hard (`max-flush`) threshold: `put`/`delete` flush unconditionally
    /// once it's reached, without running hooks. A no-op while a checkpoint
    /// or commit is already flushing (the `in_flush` guard), since a hook
    /// calling `put` must not recursively trigger another flush.
    ///
    /// This is also the spot an engine-reported structural transaction-size
    /// limit would attach: an engine that rejects a batch as "too big" would
    /// commit the current batch here and start a fresh one transparently,
    /// rather than surfacing the limit to the caller. Neither `LogCask` nor
    /// `LegacyTable` has such a limit, so no such handling exists yet.
    fn flush_if_hard_threshold_reached(&mut self) -> CResult<()> {
        if self.in_flush {
            return Ok(());
        }
        if self.batch.size() >= self.tuning.checkpoint_hard_bytes {
            self.apply_batch()?;
        }
        Ok(())
    }

    /// Explicit mid-transaction flush request. Below the soft threshold this
    /// is a no-op; at or above it, hooks run (in insertion order) and then
    /// the batch is applied.
    pub fn checkpoint(&mut self) -> CResult<()> {
        if self.in_flush {
            return Ok(());
        }
        if self.batch.size() < self.tuning.checkpoint_soft_bytes {
            return Ok(());
        }
        self.run_hooks()?;
        self.apply_batch()
    }

    /// Runs every hook then applies the batch, regardless of its size.
    pub fn commit(mut self) -> CResult<()> {
        let result = self.run_hooks().and_then(|()| self.apply_batch());
        // Releasers fire in a fixed order (snapshot first, then batch) so a
        // concurrent `close_wait` can't observe a half-released transaction
        // as fully drained.
        self.snapshot_releaser.release();
        self.batch_releaser.release();
        result
    }

    /// Discards the buffered batch and releases the transaction without
    /// applying anything.
    pub fn release(mut self) {
        self.batch = Batch::new();
        self.snapshot_releaser.release();
        self.batch_releaser.release();
    }

    fn run_hooks(&mut self) -> CResult<()> {
        if self.hooks.is_empty() {
            return Ok(());
        }
        self.in_flush = true;
        let mut hooks = std::mem::take(&mut self.hooks);
        let result = hooks.iter_mut().try_for_each(|hook| hook(self).map_err(|e| Error::Hook(Box::new(e))));
        self.hooks = hooks;
        self.in_flush = false;
        result
    }

    fn apply_batch(&mut self) -> CResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let ops = self.batch.take();
        let mut engine = self.engine.lock().expect("engine mutex poisoned");
        engine.apply_batch(&ops)
    }
}

impl<E: Engine> Drop for WriteTransaction<E> {
    fn drop(&mut self) {
        // Idempotent: a no-op if `commit`/`release` already fired. Covers
        // the panic-mid-transaction and early-`?`-return paths (I1).
        self.snapshot_releaser.release();
        self.batch_releaser.release();
    }
}

/// A forward-only, single-pass iterator over a snapshot (§4.1). Re-derives a
/// short-lived bounded range each step rather than holding a borrowed
/// iterator, so it can outlive the borrow that produced its snapshot --
/// the snapshot itself is owned (cheaply, via the engine's `Arc` backing).
pub struct TxnIterator<S: EngineSnapshot> {
    snapshot: S,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    exhausted: bool,
    releaser: Releaser,
}

impl<S: EngineSnapshot> TxnIterator<S> {
    fn new(snapshot: S, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>, counter: &Arc<CloseWaitCounter>) -> CResult<Self> {
        counter.add(1)?;
        Ok(Self { snapshot, lower, upper, exhausted: false, releaser: Releaser::new(Arc::clone(counter), 1) })
    }

    fn prefix(snapshot: S, prefix: &[u8], counter: &Arc<CloseWaitCounter>) -> CResult<Self> {
        let lower = Bound::Included(prefix.to_vec());
        let upper = match crate::util::prefix_upper_bound(prefix) {
            Some(bound) => Bound::Excluded(bound),
            None => Bound::Unbounded,
        };
        Self::new(snapshot, lower, upper, counter)
    }

    /// Releases the iterator early, e.g. to interrupt a long scan. Safe to
    /// call more than once.
    pub fn release(&self) {
        self.releaser.release();
    }
}

impl<S: EngineSnapshot> Iterator for TxnIterator<S> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let mut window = self.snapshot.range(self.lower.clone(), self.upper.clone());
        match window.next() {
            Some(Ok((key, value))) => {
                self.lower = Bound::Excluded(key.clone());
                Some(Ok((key, value)))
            }
            Some(Err(err)) => {
                self.exhausted = true;
                Some(Err(err))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::tuning::Tuning;

    fn harness() -> (Arc<Mutex<MemoryEngine>>, Arc<CloseWaitCounter>, EngineTuning) {
        let engine = Arc::new(Mutex::new(MemoryEngine::new()));
        let counter = CloseWaitCounter::new();
        let tuning = Tuning::Small.resolve(std::path::Path::new("."), None);
        (engine, counter, tuning)
    }

    fn write_txn(
        engine: &Arc<Mutex<MemoryEngine>>,
        counter: &Arc<CloseWaitCounter>,
        tuning: EngineTuning,
        hooks: Vec<Hook<MemoryEngine>>,
    ) -> WriteTransaction<MemoryEngine> {
        let snapshot = engine.lock().unwrap().snapshot();
        WriteTransaction::new(Arc::clone(engine), snapshot, hooks, tuning, counter).unwrap()
    }

    #[test]
    fn write_transaction_never_sees_its_own_batch() {
        let (engine, counter, tuning) = harness();
        engine.lock().unwrap().set(b"a", vec![1]).unwrap();

        let mut txn = write_txn(&engine, &counter, tuning, vec![]);
        txn.put(b"a", vec![2]).unwrap();
        assert_eq!(txn.get(b"a").unwrap(), vec![1]);
        txn.commit().unwrap();

        assert_eq!(engine.lock().unwrap().get(b"a").unwrap(), vec![2]);
    }

    #[test]
    fn checkpoint_below_soft_threshold_does_not_flush() {
        let (engine, counter, tuning) = harness();
        let mut txn = write_txn(&engine, &counter, tuning, vec![]);
        txn.put(b"a", vec![1]).unwrap();
        txn.checkpoint().unwrap();

        assert!(crate::error::is_not_found(&engine.lock().unwrap().get(b"a").unwrap_err()));
        txn.release();
    }

    #[test]
    fn checkpoint_at_or_above_soft_threshold_flushes_and_runs_hooks() {
        let (engine, counter, mut tuning) = harness();
        tuning.checkpoint_soft_bytes = 1;
        let hook_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hook_ran_inner = Arc::clone(&hook_ran);
        let hook: Hook<MemoryEngine> = Box::new(move |txn| {
            hook_ran_inner.store(true, std::sync::atomic::Ordering::SeqCst);
            txn.put(b"hook-key", vec![9])
        });

        let mut txn = write_txn(&engine, &counter, tuning, vec![hook]);
        txn.put(b"a", vec![1]).unwrap();
        txn.checkpoint().unwrap();

        assert!(hook_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(engine.lock().unwrap().get(b"a").unwrap(), vec![1]);
        assert_eq!(engine.lock().unwrap().get(b"hook-key").unwrap(), vec![9]);
        txn.release();
    }

    #[test]
    fn hard_threshold_flushes_without_running_hooks() {
        let (engine, counter, mut tuning) = harness();
        tuning.checkpoint_hard_bytes = 1;
        let hook_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hook_ran_inner = Arc::clone(&hook_ran);
        let hook: Hook<MemoryEngine> = Box::new(move |_| {
            hook_ran_inner.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        let mut txn = write_txn(&engine, &counter, tuning, vec![hook]);
        txn.put(b"a", vec![1]).unwrap(); // exceeds the (artificially tiny) hard threshold

        assert!(!hook_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(engine.lock().unwrap().get(b"a").unwrap(), vec![1]);
        txn.release();
    }

    #[test]
    fn hook_error_aborts_flush_and_preserves_batch() {
        let (engine, counter, mut tuning) = harness();
        tuning.checkpoint_soft_bytes = 1;
        let hook: Hook<MemoryEngine> = Box::new(|_| Err(Error::value("hook blew up")));

        let mut txn = write_txn(&engine, &counter, tuning, vec![hook]);
        txn.put(b"a", vec![1]).unwrap();
        let result = txn.checkpoint();

        assert!(result.is_err());
        assert!(crate::error::is_not_found(&engine.lock().unwrap().get(b"a").unwrap_err()));
        // The transaction is still usable: a fresh checkpoint attempt can
        // still see the preserved batch via a direct read check.
        assert!(crate::error::is_not_found(&txn.get(b"a").unwrap_err())); // snapshot, not the batch
        txn.release();
    }

    #[test]
    fn write_transaction_holds_two_releasers_both_released_on_drop() {
        let (engine, counter, tuning) = harness();
        let txn = write_txn(&engine, &counter, tuning, vec![]);
        assert_eq!(counter.outstanding(), 2);
        drop(txn);
        assert_eq!(counter.outstanding(), 0);
    }

    #[test]
    fn commit_then_explicit_release_is_a_harmless_no_op() {
        let (engine, counter, tuning) = harness();
        let mut txn = write_txn(&engine, &counter, tuning, vec![]);
        txn.put(b"a", vec![1]).unwrap();
        txn.commit().unwrap();
        assert_eq!(counter.outstanding(), 0);
        assert_eq!(engine.lock().unwrap().get(b"a").unwrap(), vec![1]);
    }

    #[test]
    fn iterator_is_forward_only_and_stable_after_later_writes() {
        let (engine, counter, _tuning) = harness();
        {
            let mut e = engine.lock().unwrap();
            e.set(b"a", vec![1]).unwrap();
            e.set(b"b", vec![2]).unwrap();
        }
        let snapshot = engine.lock().unwrap().snapshot();
        let read = ReadTransaction::<MemoryEngine>::new(snapshot, &counter).unwrap();
        let iter = read.range(Bound::Unbounded, Bound::Unbounded).unwrap();

        engine.lock().unwrap().set(b"c", vec![3]).unwrap();

        let items: Vec<_> = iter.collect::<CResult<Vec<_>>>().unwrap();
        assert_eq!(items, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2])]);
    }
}
