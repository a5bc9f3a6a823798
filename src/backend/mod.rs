//! The `Backend` type: the uniform contract callers actually use (§4.1).
//!
//! `Backend<E>` is generic and monomorphic -- every call site in this crate
//! uses it directly. `DynBackend` is a thin object-safe trait over it, for
//! the rare caller that needs to hold "a backend of some engine, I don't
//! care which" without itself becoming generic.

use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::engine::legacy::LegacyTable;
use crate::engine::logcask::LogCask;
use crate::engine::memory::MemoryEngine;
use crate::engine::tuning::{EngineTuning, Tuning};
use crate::engine::{Engine, Status};
use crate::error::CResult;
use crate::lifecycle::{CloseWaitCounter, Releaser};
use crate::txn::{Hook, ReadTransaction, TxnIterator, WriteTransaction};

pub struct Backend<E: Engine> {
    engine: Arc<Mutex<E>>,
    lifecycle: Arc<CloseWaitCounter>,
    tuning: EngineTuning,
    location: String,
}

impl<E: Engine> Backend<E> {
    pub fn from_engine(engine: E, tuning: EngineTuning, location: String) -> Self {
        Self { engine: Arc::new(Mutex::new(engine)), lifecycle: CloseWaitCounter::new(), tuning, location }
    }

    /// Direct, single-operation get. Wraps an implicit transaction: admits
    /// and releases one unit of work for the call's duration.
    /// `Err(Error::NotFound)` if `key` is absent.
    pub fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.lifecycle.add(1)?;
        let _releaser = Releaser::new(Arc::clone(&self.lifecycle), 1);
        self.engine.lock().expect("engine mutex poisoned").get(key)
    }

    pub fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.lifecycle.add(1)?;
        let _releaser = Releaser::new(Arc::clone(&self.lifecycle), 1);
        self.engine.lock().expect("engine mutex poisoned").set(key, value)
    }

    /// A no-op, not an error, if `key` is absent (P2).
    pub fn delete(&self, key: &[u8]) -> CResult<()> {
        self.lifecycle.add(1)?;
        let _releaser = Releaser::new(Arc::clone(&self.lifecycle), 1);
        self.engine.lock().expect("engine mutex poisoned").delete(key)
    }

    pub fn new_read_transaction(&self) -> CResult<ReadTransaction<E>> {
        self.lifecycle.add(0)?; // fails fast with Closed before taking the snapshot
        let snapshot = self.engine.lock().expect("engine mutex poisoned").snapshot();
        ReadTransaction::new(snapshot, &self.lifecycle)
    }

    pub fn new_write_transaction(&self, hooks: Vec<Hook<E>>) -> CResult<WriteTransaction<E>> {
        self.lifecycle.add(0)?;
        let snapshot = self.engine.lock().expect("engine mutex poisoned").snapshot();
        WriteTransaction::new(Arc::clone(&self.engine), snapshot, hooks, self.tuning, &self.lifecycle)
    }

    /// An iterator with an implicit snapshot taken at creation time, stable
    /// for its entire scan regardless of concurrent writes (§4.1).
    pub fn range_iter(&self, lo: Bound<Vec<u8>>, hi: Bound<Vec<u8>>) -> CResult<TxnIterator<E::Snapshot>> {
        self.lifecycle.add(0)?;
        let snapshot = self.engine.lock().expect("engine mutex poisoned").snapshot();
        TxnIterator::new(snapshot, lo, hi, &self.lifecycle)
    }

    pub fn prefix_iter(&self, prefix: &[u8]) -> CResult<TxnIterator<E::Snapshot>> {
        self.lifecycle.add(0)?;
        let snapshot = self.engine.lock().expect("engine mutex poisoned").snapshot();
        TxnIterator::prefix(snapshot, prefix, &self.lifecycle)
    }

    pub fn compact(&self) -> CResult<()> {
        self.lifecycle.add(1)?;
        let _releaser = Releaser::new(Arc::clone(&self.lifecycle), 1);
        self.engine.lock().expect("engine mutex poisoned").compact()
    }

    pub fn status(&self) -> CResult<Status> {
        self.lifecycle.add(1)?;
        let _releaser = Releaser::new(Arc::clone(&self.lifecycle), 1);
        self.engine.lock().expect("engine mutex poisoned").status()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Seals the backend against new work, then blocks until every
    /// outstanding transaction, iterator, and direct operation has released
    /// (I4, P6).
    pub fn close(&self) {
        self.lifecycle.close_wait();
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> u64 {
        self.lifecycle.outstanding()
    }
}

/// Opens (or creates) a `LogCask`-backed database at `dir`.
pub fn open(dir: &Path, tuning: Tuning) -> CResult<Backend<LogCask>> {
    let resolved = tuning.resolve(dir, None);
    let engine = LogCask::open(dir, tuning)?;
    Ok(Backend::from_engine(engine, resolved, dir.display().to_string()))
}

/// Opens a `LegacyTable`-backed database at `dir`, for migration sources.
pub fn open_legacy(dir: &Path, tuning: Tuning) -> CResult<Backend<LegacyTable>> {
    let resolved = tuning.resolve(dir, None);
    let engine = LegacyTable::open(dir, tuning)?;
    Ok(Backend::from_engine(engine, resolved, dir.display().to_string()))
}

/// Opens an in-memory database with no on-disk presence (`location() == ""`).
pub fn open_in_memory() -> Backend<MemoryEngine> {
    let tuning = Tuning::Small.resolve(Path::new("."), None);
    Backend::from_engine(MemoryEngine::new(), tuning, String::new())
}

/// Object-safe facade over `Backend<E>`, for callers that want to hold "a
/// backend of some engine" without becoming generic over `E` themselves.
pub trait DynBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> CResult<Vec<u8>>;
    fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()>;
    fn delete(&self, key: &[u8]) -> CResult<()>;
    fn compact(&self) -> CResult<()>;
    fn status(&self) -> CResult<Status>;
    fn location(&self) -> &str;
    fn close(&self);
}

impl<E: Engine> DynBackend for Backend<E> {
    fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        Backend::get(self, key)
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        Backend::put(self, key, value)
    }

    fn delete(&self, key: &[u8]) -> CResult<()> {
        Backend::delete(self, key)
    }

    fn compact(&self) -> CResult<()> {
        Backend::compact(self)
    }

    fn status(&self) -> CResult<Status> {
        Backend::status(self)
    }

    fn location(&self) -> &str {
        Backend::location(self)
    }

    fn close(&self) {
        Backend::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{is_closed, is_not_found};

    #[test]
    fn direct_get_put_delete_roundtrip() {
        let backend = open_in_memory();
        assert!(is_not_found(&backend.get(b"a").unwrap_err()));
        backend.put(b"a", vec![1]).unwrap();
        assert_eq!(backend.get(b"a").unwrap(), vec![1]);
        backend.delete(b"a").unwrap();
        assert!(is_not_found(&backend.get(b"a").unwrap_err()));
    }

    #[test]
    fn delete_of_absent_key_is_benign() {
        // P2
        let backend = open_in_memory();
        backend.delete(b"nonexistent").unwrap();
    }

    #[test]
    fn write_transaction_does_not_see_its_own_writes() {
        // P1
        let backend = open_in_memory();
        backend.put(b"k", vec![1]).unwrap();

        let mut txn = backend.new_write_transaction(vec![]).unwrap();
        txn.put(b"k", vec![2]).unwrap();
        assert_eq!(txn.get(b"k").unwrap(), vec![1]);
        txn.commit().unwrap();

        assert_eq!(backend.get(b"k").unwrap(), vec![2]);
    }

    #[test]
    fn operations_after_close_fail_with_closed() {
        // P3 (direct-operation variant), I4
        let backend = open_in_memory();
        backend.close();

        let err = backend.put(b"a", vec![1]).unwrap_err();
        assert!(is_closed(&err));
        let err = backend.new_read_transaction().unwrap_err();
        assert!(is_closed(&err));
    }

    #[test]
    fn close_waits_for_outstanding_transaction() {
        // P6
        let backend = Arc::new(open_in_memory());
        let txn = backend.new_read_transaction().unwrap();
        assert_eq!(backend.outstanding(), 1);

        let closer = Arc::clone(&backend);
        let handle = std::thread::spawn(move || closer.close());

        std::thread::sleep(std::time::Duration::from_millis(20));
        txn.release();
        handle.join().unwrap();
        assert_eq!(backend.outstanding(), 0);
    }

    #[test]
    fn range_iter_has_a_stable_view_across_concurrent_writes() {
        let backend = open_in_memory();
        backend.put(b"a", vec![1]).unwrap();
        backend.put(b"b", vec![2]).unwrap();

        let iter = backend.range_iter(Bound::Unbounded, Bound::Unbounded).unwrap();
        backend.put(b"c", vec![3]).unwrap();

        let items: Vec<_> = iter.collect::<CResult<Vec<_>>>().unwrap();
        assert_eq!(items, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2])]);
    }

    #[test]
    fn not_found_predicate_matches_absent_key_via_dyn_backend() {
        let backend = open_in_memory();
        let dynamic: &dyn DynBackend = &backend;
        assert!(is_not_found(&dynamic.get(b"missing").unwrap_err()));
    }
}
