//! `LegacyTable`: a complete whole-file sorted table, representing an older
//! on-disk layout a directory might still be sitting on when the migration
//! driver (§4.5) is asked to bring it forward to `LogCask`.
//!
//! This is the simplest on-disk shape that still deserves to be called a
//! real legacy format: the whole keyspace serialized as one `BTreeMap` with
//! `bincode`, rewritten in full on every mutation. That's exactly the kind
//! of engine a migration away from is worth having.
//!
//! Every write keeps the previous image around as `table.bin.bak` before
//! replacing `table.bin`, so a crash between the two renames still leaves a
//! readable table to recover from.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::engine::open_policy::open_or_recreate;
use crate::engine::tuning::Tuning;
use crate::engine::{Engine, EngineSnapshot, Op, Status};
use crate::error::{CResult, Error};

const TABLE_FILE_NAME: &str = "table.bin";
const BACKUP_FILE_NAME: &str = "table.bin.bak";

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// On-disk row shape: `serde_bytes` avoids bincode's default per-element
/// `Vec<u8>` encoding, serializing each buffer as one length-prefixed blob.
#[derive(Serialize, Deserialize)]
struct OnDiskEntry {
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
}

fn encode_table(table: &Table) -> CResult<Vec<u8>> {
    let rows: Vec<OnDiskEntry> =
        table.iter().map(|(k, v)| OnDiskEntry { key: k.clone(), value: v.clone() }).collect();
    Ok(bincode::serialize(&rows)?)
}

fn decode_table(bytes: &[u8]) -> Result<Table, bincode::Error> {
    let rows: Vec<OnDiskEntry> = bincode::deserialize(bytes)?;
    Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
}

pub struct LegacyTable {
    dir: PathBuf,
    table: Table,
}

impl LegacyTable {
    pub fn open(dir: &Path, _tuning: Tuning) -> CResult<Self> {
        open_or_recreate(dir, Self::open_once, Self::recover)
    }

    fn table_path(dir: &Path) -> PathBuf {
        dir.join(TABLE_FILE_NAME)
    }

    fn backup_path(dir: &Path) -> PathBuf {
        dir.join(BACKUP_FILE_NAME)
    }

    fn open_once(dir: &Path) -> CResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = Self::table_path(dir);
        let table = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Table::new(),
            Ok(bytes) => decode_table(&bytes)
                .map_err(|e| Error::Corrupted(format!("{} is not a valid table: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { dir: dir.to_path_buf(), table })
    }

    /// Falls back to the previous image kept as `table.bin.bak`.
    fn recover(dir: &Path) -> CResult<Self> {
        let backup = Self::backup_path(dir);
        log::warn!("{} recovering from {}", Self::table_path(dir).display(), backup.display());
        let bytes = std::fs::read(&backup).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Corrupted(format!("no backup table at {}", backup.display()))
            } else {
                Error::Io(e)
            }
        })?;
        let table = decode_table(&bytes)
            .map_err(|e| Error::Corrupted(format!("backup table is also invalid: {e}")))?;
        let recovered = Self { dir: dir.to_path_buf(), table };
        recovered.persist()?;
        Ok(recovered)
    }

    /// Rewrites the whole table to disk, keeping the prior image as a backup.
    fn persist(&self) -> CResult<()> {
        let path = Self::table_path(&self.dir);
        let backup = Self::backup_path(&self.dir);
        let tmp = self.dir.join("table.bin.tmp");

        let bytes = encode_table(&self.table)?;
        std::fs::write(&tmp, &bytes)?;

        if path.exists() {
            std::fs::rename(&path, &backup)?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Engine for LegacyTable {
    type Snapshot = LegacyTableSnapshot;

    fn get(&mut self, key: &[u8]) -> CResult<Vec<u8>> {
        self.table.get(key).cloned().ok_or(Error::NotFound)
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.table.insert(key.to_vec(), value);
        self.persist()
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.table.remove(key);
        self.persist()
    }

    fn apply_batch(&mut self, ops: &[Op]) -> CResult<()> {
        for op in ops {
            match op {
                Op::Put(k, v) => {
                    self.table.insert(k.clone(), v.clone());
                }
                Op::Delete(k) => {
                    self.table.remove(k);
                }
            }
        }
        self.persist()
    }

    fn snapshot(&self) -> Self::Snapshot {
        LegacyTableSnapshot { table: Arc::new(self.table.clone()) }
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.table.len() as u64;
        let size = self.table.iter().fold(0u64, |acc, (k, v)| acc + k.len() as u64 + v.len() as u64);
        let total_disk_size = std::fs::metadata(Self::table_path(&self.dir)).map(|m| m.len()).unwrap_or(0);
        Ok(Status {
            name: "legacy".to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size: total_disk_size,
            garbage_disk_size: 0,
        })
    }

    /// Always fully compacted -- every write already rewrites the whole
    /// table -- so this is a no-op.
    fn compact(&mut self) -> CResult<()> {
        Ok(())
    }

    fn location(&self) -> &str {
        self.dir.to_str().unwrap_or("")
    }
}

#[derive(Clone)]
pub struct LegacyTableSnapshot {
    table: Arc<Table>,
}

impl EngineSnapshot for LegacyTableSnapshot {
    fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.table.get(key).cloned().ok_or(Error::NotFound)
    }

    fn range<'a>(
        &'a self,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
    ) -> Box<dyn DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>> + 'a> {
        Box::new(self.table.range((start, end)).map(|(k, v)| Ok((k.clone(), v.clone()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::engine::conformance::test_engine!({
        let dir = tempfile::tempdir()?;
        LegacyTable::open(dir.into_path().as_path(), Tuning::Small)?
    });

    #[test]
    fn reopen_recovers_same_contents() -> CResult<()> {
        use crate::error::is_not_found;

        let dir = tempfile::tempdir()?;
        let mut s = LegacyTable::open(dir.path(), Tuning::Small)?;
        s.set(b"a", vec![1])?;
        s.set(b"b", vec![2])?;
        s.delete(b"a")?;
        drop(s);

        let mut reopened = LegacyTable::open(dir.path(), Tuning::Small)?;
        assert!(is_not_found(&reopened.get(b"a").unwrap_err()));
        assert_eq!(reopened.get(b"b")?, vec![2]);
        Ok(())
    }

    #[test]
    fn corrupted_table_recovers_from_backup() -> CResult<()> {
        use crate::error::is_not_found;

        let dir = tempfile::tempdir()?;
        let mut s = LegacyTable::open(dir.path(), Tuning::Small)?;
        s.set(b"a", vec![1])?;
        s.set(b"b", vec![2])?; // leaves a valid table.bin.bak holding just {a: [1]}
        drop(s);

        std::fs::write(dir.path().join(TABLE_FILE_NAME), b"garbage, not bincode")?;

        let mut recovered = LegacyTable::open(dir.path(), Tuning::Small)?;
        assert_eq!(recovered.get(b"a")?, vec![1]);
        assert!(is_not_found(&recovered.get(b"b").unwrap_err()));
        Ok(())
    }

    #[test]
    fn empty_directory_opens_as_empty_table() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut s = LegacyTable::open(dir.path(), Tuning::Small)?;
        assert!(crate::error::is_not_found(&s.get(b"anything").unwrap_err()));
        assert_eq!(s.status()?.keys, 0);
        Ok(())
    }
}
