//! Schema-migration driver (§4.5): bulk-copies a whole keyspace from one
//! engine directory to another using only the `Backend`/`Engine` trait
//! surface, so it works identically whether the source is a `LegacyTable`
//! or any other `Engine` impl.
//!
//! Follows the same "never touch the source until the destination is
//! durably written" discipline `LogCask::compact` uses for its own
//! rewrite-and-rename (I5), generalized from a single-engine compaction to
//! a cross-engine copy.

use std::path::Path;

use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::{CResult, Error};
use crate::kv_typed::{migrated_by_key, migrated_from_key, misc};
use crate::txn::Hook;

/// Number of entries buffered per destination checkpoint (§4.5 step 4).
const BATCH_SIZE: usize = 1000;

/// The `mtime/` auxiliary namespace migrated by a second pass (§4.5 expansion).
const MTIME_PREFIX: &[u8] = b"mtime/";

/// Advisory progress, emitted periodically; never gates correctness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationProgress {
    pub source_engine: String,
    pub entries_migrated: u64,
}

/// Migrates the entire keyspace of `source` into `destination`, then the
/// `mtime/` auxiliary namespace, then records the migration marker.
///
/// Idempotent (I5): if the destination already carries the marker for
/// `source_engine_name`, this returns immediately without touching either
/// engine. If interrupted partway, the marker is never written, so a
/// subsequent call starts over from scratch (the destination may already
/// hold some entries from the aborted attempt, but since every key is
/// copied verbatim by value, re-copying is harmless).
pub fn migrate<S: Engine, D: Engine>(
    source: &Backend<S>,
    destination: &Backend<D>,
    source_engine_name: &str,
    binary_version: &str,
    on_progress: impl Fn(MigrationProgress),
) -> CResult<()> {
    let marker_key = migrated_from_key(source_engine_name);
    let misc_ns = misc(destination);
    if misc_ns.get_time(&marker_key)?.1 {
        log::info!("already migrated from {source_engine_name}, skipping");
        return Ok(());
    }

    let mut total = 0u64;
    total += copy_prefix(source, destination, &[], Some(MTIME_PREFIX), &mut |n| {
        on_progress(MigrationProgress { source_engine: source_engine_name.to_string(), entries_migrated: n });
    })?;
    total += copy_prefix(source, destination, MTIME_PREFIX, None, &mut |n| {
        on_progress(MigrationProgress {
            source_engine: source_engine_name.to_string(),
            entries_migrated: total + n,
        });
    })?;

    misc_ns.set_time(&marker_key, now())?;
    misc_ns.set_string(&migrated_by_key(source_engine_name), binary_version)?;

    rename_source_directory(source.location())?;
    log::info!("migration from {source_engine_name} complete, {total} entries copied");
    Ok(())
}

/// Streams `prefix`-bounded key/value pairs from `source` into `destination`
/// in source order, draining into a `checkpoint()` every `BATCH_SIZE`
/// entries, returning the count copied. Entries starting with
/// `exclude_prefix` are skipped (used by the main pass to leave the `mtime/`
/// namespace to its own dedicated pass, so the two passes copy disjoint
/// key sets instead of doubling up on overlap).
fn copy_prefix<S: Engine, D: Engine>(
    source: &Backend<S>,
    destination: &Backend<D>,
    prefix: &[u8],
    exclude_prefix: Option<&[u8]>,
    on_batch: &mut impl FnMut(u64),
) -> CResult<u64> {
    let iter = source.prefix_iter(prefix)?;
    let hooks: Vec<Hook<D>> = vec![];
    let mut txn = destination.new_write_transaction(hooks)?;

    let mut copied_since_checkpoint = 0usize;
    let mut total = 0u64;
    for entry in iter {
        let (key, value) = entry?;
        if let Some(excluded) = exclude_prefix {
            if key.starts_with(excluded) {
                continue;
            }
        }
        txn.put(&key, value)?;
        copied_since_checkpoint += 1;
        total += 1;

        if copied_since_checkpoint >= BATCH_SIZE {
            txn.checkpoint()?;
            copied_since_checkpoint = 0;
            on_batch(total);
        }
    }

    txn.commit()?;
    on_batch(total);
    Ok(total)
}

/// Renames the source directory to `<original>.migrated.<timestamp>`, so it
/// is preserved for manual recovery but never read back (§6.1). A no-op for
/// an in-memory source (`location() == ""`).
fn rename_source_directory(location: &str) -> CResult<()> {
    if location.is_empty() {
        return Ok(());
    }
    let source = Path::new(location);
    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let renamed = source.with_file_name(format!(
        "{}.migrated.{timestamp}",
        source.file_name().and_then(|n| n.to_str()).unwrap_or("db")
    ));
    std::fs::rename(source, &renamed).map_err(Error::from)
}

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::open_in_memory;

    #[test]
    fn migrates_full_keyspace_and_writes_marker() {
        let source = open_in_memory();
        source.put(b"a", vec![1]).unwrap();
        source.put(b"b", vec![2]).unwrap();
        source.put(b"mtime/file1", vec![9]).unwrap();

        let destination = open_in_memory();
        let progress = std::cell::RefCell::new(vec![]);
        migrate(&source, &destination, "legacy", "syncdb-test", |p| progress.borrow_mut().push(p)).unwrap();

        assert_eq!(destination.get(b"a").unwrap(), vec![1]);
        assert_eq!(destination.get(b"b").unwrap(), vec![2]);
        assert_eq!(destination.get(b"mtime/file1").unwrap(), vec![9]);
        assert!(!progress.borrow().is_empty());

        let ns = misc(&destination);
        assert!(ns.get_time(&migrated_from_key("legacy")).unwrap().1);
        assert_eq!(ns.get_string(&migrated_by_key("legacy")).unwrap().0, "syncdb-test");
    }

    #[test]
    fn rerunning_after_success_is_a_no_op() {
        // P8
        let source = open_in_memory();
        source.put(b"a", vec![1]).unwrap();
        let destination = open_in_memory();

        migrate(&source, &destination, "legacy", "v1", |_| {}).unwrap();
        destination.put(b"a", vec![99]).unwrap(); // simulate drift after migration

        migrate(&source, &destination, "legacy", "v1", |_| {}).unwrap();
        // Since migration was skipped (marker present), the drifted value
        // is untouched by a second copy pass.
        assert_eq!(destination.get(b"a").unwrap(), vec![99]);
    }

    #[test]
    fn batches_checkpoint_every_thousand_entries() {
        let source = open_in_memory();
        for i in 0u32..(BATCH_SIZE as u32 * 2 + 7) {
            source.put(&i.to_be_bytes(), vec![1]).unwrap();
        }
        let destination = open_in_memory();
        let mut batches = 0u32;
        migrate(&source, &destination, "legacy", "v1", |_| batches += 1).unwrap();

        // At least 2 full batches plus the trailing partial batch for each
        // of the two namespace passes (main + empty mtime pass).
        assert!(batches >= 2);
        for i in 0u32..(BATCH_SIZE as u32 * 2 + 7) {
            assert_eq!(destination.get(&i.to_be_bytes()).unwrap(), vec![1]);
        }
    }
}
