//! `LogCask`: the primary on-disk engine, an append-only log file plus an
//! in-memory keydir mapping each live key to its value's file position.
//!
//! The on-disk entry format, append/build-keydir recovery logic, compaction,
//! size-triggered auto-compaction, and flush-on-`Drop` all follow the
//! classic bitcask-style design this module's name nods to. Two things are
//! layered on top that a single-writer, single-reader design wouldn't need:
//!
//! - The `Engine`/`EngineSnapshot` split means reads must be able to proceed
//!   through an old snapshot while the log keeps growing underneath via a
//!   different handle. `LogCaskSnapshot` holds its own dup'd file
//!   descriptor (`File::try_clone`) and reads through it with positional
//!   reads (`read_at`/`seek_read`), which don't touch the shared file
//!   cursor and need no locking. On Unix this also makes `compact()` safe
//!   for outstanding snapshots for free: renaming a new file over the log
//!   path leaves already-open file descriptions (including dup'd ones)
//!   pointing at the old inode's bytes.
//! - Opening goes through `open_policy::open_or_recreate`, gated on a small
//!   magic header so a scrambled file is detected as corruption rather than
//!   silently misparsed as a legal entry stream.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::FileExt;

use crate::engine::open_policy::open_or_recreate;
use crate::engine::tuning::{EngineTuning, Tuning};
use crate::engine::{Engine, EngineSnapshot, Op, Status};
use crate::error::{CResult, Error};

const LOG_FILE_NAME: &str = "data.log";
const LOG_MAGIC: &[u8; 8] = b"SYNCDBK1";

type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

pub struct LogCask {
    path: PathBuf,
    file: File,
    keydir: KeyDir,
    tuning: EngineTuning,
}

impl LogCask {
    /// Opens (or creates) a `LogCask` rooted at `dir`, applying the 4-step
    /// opening policy on header corruption.
    pub fn open(dir: &Path, tuning: Tuning) -> CResult<Self> {
        let resolved = tuning.resolve(dir, None);
        open_or_recreate(
            dir,
            |dir| Self::open_once(dir, resolved, true),
            |dir| Self::recover(dir, resolved),
        )
    }

    /// Opens without taking the exclusive file lock. Only for tests that
    /// need two handles on the same directory in one process.
    #[cfg(test)]
    fn open_unlocked(dir: &Path, tuning: Tuning) -> CResult<Self> {
        let resolved = tuning.resolve(dir, None);
        Self::open_once(dir, resolved, false)
    }

    fn log_path(dir: &Path) -> PathBuf {
        dir.join(LOG_FILE_NAME)
    }

    fn open_once(dir: &Path, tuning: EngineTuning, try_lock: bool) -> CResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = Self::log_path(dir);
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        if try_lock {
            file.try_lock_exclusive()?;
        }

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(LOG_MAGIC)?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            if file.read_exact(&mut header).is_err() || &header != LOG_MAGIC {
                return Err(Error::Corrupted(format!("{} has an invalid or missing header", path.display())));
            }
        }

        let keydir = build_keydir(&mut file, 8)?;
        Ok(Self { path, file, keydir, tuning })
    }

    /// Reinterprets the file as headerless (legacy) content starting at
    /// offset 0, rebuilds the keydir from it, and rewrites it with a fresh
    /// header so future opens take the fast path again.
    fn recover(dir: &Path, tuning: EngineTuning) -> CResult<Self> {
        let path = Self::log_path(dir);
        log::warn!("{} recovering by reparsing from offset 0", path.display());
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let keydir = build_keydir(&mut file, 0)?;

        let recovered = Self { path: path.clone(), file, keydir, tuning };
        let tmp_path = path.with_extension("recover");
        let (new_file, new_keydir) = write_compacted_log(&recovered.file, &recovered.keydir, &tmp_path)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(Self { path, file: new_file, keydir: new_keydir, tuning })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads the append-only entry stream starting at `start`, building the
/// keydir. An incomplete trailing entry (the tail of a torn write) is
/// treated as a crash artifact: the file is truncated to the last complete
/// entry and the scan stops there.
fn build_keydir(file: &mut File, start: u64) -> CResult<KeyDir> {
    use byteorder::{BigEndian, ReadBytesExt};

    let mut keydir = KeyDir::new();
    let file_len = file.metadata()?.len();
    let mut pos = file.seek(SeekFrom::Start(start))?;

    while pos < file_len {
        let mut read_entry = || -> std::io::Result<(Vec<u8>, u64, Option<u32>)> {
            let key_len = file.read_u32::<BigEndian>()?;
            let value_len_or_tombstone = match file.read_i32::<BigEndian>()? {
                l if l >= 0 => Some(l as u32),
                _ => None,
            };
            let value_pos = pos + 4 + 4 + key_len as u64;

            let mut key = vec![0u8; key_len as usize];
            file.read_exact(&mut key)?;

            if let Some(value_len) = value_len_or_tombstone {
                if value_pos + value_len as u64 > file_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "value extends beyond end of file",
                    ));
                }
                file.seek(SeekFrom::Current(value_len as i64))?;
            }

            Ok((key, value_pos, value_len_or_tombstone))
        };

        match read_entry() {
            Ok((key, value_pos, Some(value_len))) => {
                keydir.insert(key, (value_pos, value_len));
                pos = value_pos + value_len as u64;
            }
            Ok((key, value_pos, None)) => {
                keydir.remove(&key);
                pos = value_pos;
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::warn!("found incomplete entry at offset {pos}, truncating");
                file.set_len(pos)?;
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(keydir)
}

fn read_value_at(file: &File, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
    let mut value = vec![0u8; value_len as usize];
    read_exact_at(file, &mut value, value_pos)?;
    Ok(value)
}

#[cfg(unix)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !buf.is_empty() {
        match file.read_at(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read from log"))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read from log"))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn write_entry(file: &mut File, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
    use byteorder::{BigEndian, WriteBytesExt};
    use bytes::{BufMut, BytesMut};

    let key_len = key.len() as u32;
    let value_len = value.map_or(0, |v| v.len() as u32);
    let value_len_or_tombstone = value.map_or(-1i32, |v| v.len() as i32);
    let entry_len = 4 + 4 + key_len + value_len;

    let mut header = BytesMut::with_capacity(8);
    {
        let mut writer = (&mut header).writer();
        writer.write_u32::<BigEndian>(key_len)?;
        writer.write_i32::<BigEndian>(value_len_or_tombstone)?;
    }

    let pos = file.seek(SeekFrom::End(0))?;
    file.write_all(&header)?;
    file.write_all(key)?;
    if let Some(value) = value {
        file.write_all(value)?;
    }
    file.flush()?;
    Ok((pos, entry_len))
}

/// Writes a fresh log file at `tmp_path` containing only the live entries in
/// `keydir`, in key order, with a magic header, returning the new file and
/// keydir. Used by both `compact()` and `recover()`.
fn write_compacted_log(source: &File, keydir: &KeyDir, tmp_path: &Path) -> CResult<(File, KeyDir)> {
    let mut new_file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(tmp_path)?;
    new_file.write_all(LOG_MAGIC)?;

    let mut new_keydir = KeyDir::new();
    for (key, (value_pos, value_len)) in keydir.iter() {
        let value = read_value_at(source, *value_pos, *value_len)?;
        let (pos, len) = write_entry(&mut new_file, key, Some(&value))?;
        new_keydir.insert(key.clone(), (pos + len as u64 - *value_len as u64, *value_len));
    }
    new_file.sync_all()?;
    Ok((new_file, new_keydir))
}

impl Engine for LogCask {
    type Snapshot = LogCaskSnapshot;

    fn get(&mut self, key: &[u8]) -> CResult<Vec<u8>> {
        match self.keydir.get(key) {
            Some((pos, len)) => read_value_at(&self.file, *pos, *len),
            None => Err(Error::NotFound),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let value_len = value.len() as u32;
        let (pos, len) = write_entry(&mut self.file, key, Some(&value))?;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        write_entry(&mut self.file, key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    fn apply_batch(&mut self, ops: &[Op]) -> CResult<()> {
        for op in ops {
            match op {
                Op::Put(k, v) => self.set(k, v.clone())?,
                Op::Delete(k) => self.delete(k)?,
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Self::Snapshot {
        let file = self.file.try_clone().expect("dup of log file descriptor");
        LogCaskSnapshot { keydir: Arc::new(self.keydir.clone()), file: Arc::new(file) }
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.keydir.len() as u64;
        let size = self.keydir.iter().fold(0u64, |acc, (k, (_, vlen))| acc + k.len() as u64 + *vlen as u64);
        let total_disk_size = self.file.metadata()?.len();
        let live_disk_size = size + 8 * keys + 8; // entry headers plus the magic header
        let garbage_disk_size = total_disk_size.saturating_sub(live_disk_size);
        Ok(Status {
            name: "logcask".to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }

    fn compact(&mut self) -> CResult<()> {
        let tmp_path = self.path.with_extension("compact");
        let (new_file, new_keydir) = write_compacted_log(&self.file, &self.keydir, &tmp_path)?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = new_file;
        self.keydir = new_keydir;
        Ok(())
    }

    fn location(&self) -> &str {
        self.path.parent().and_then(|p| p.to_str()).unwrap_or("")
    }
}

/// Auto-compacts on open if garbage exceeds `garbage_ratio_threshold` of the
/// total file size.
pub fn open_with_auto_compact(dir: &Path, tuning: Tuning, garbage_ratio_threshold: f64) -> CResult<LogCask> {
    let mut cask = LogCask::open(dir, tuning)?;
    let status = cask.status()?;
    if status.total_disk_size == 0 {
        return Ok(cask);
    }
    let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
    if status.garbage_disk_size > 0 && garbage_ratio >= garbage_ratio_threshold {
        log::info!(
            "compacting {} to remove {} bytes of garbage ({:.0}% of {} bytes)",
            cask.path.display(),
            status.garbage_disk_size,
            garbage_ratio * 100.0,
            status.total_disk_size
        );
        cask.compact()?;
    }
    Ok(cask)
}

impl Drop for LogCask {
    fn drop(&mut self) {
        if let Err(error) = self.file.sync_all() {
            log::error!("failed to flush {}: {error}", self.path.display());
        }
    }
}

#[derive(Clone)]
pub struct LogCaskSnapshot {
    keydir: Arc<KeyDir>,
    file: Arc<File>,
}

impl EngineSnapshot for LogCaskSnapshot {
    fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        match self.keydir.get(key) {
            Some((pos, len)) => read_value_at(&self.file, *pos, *len),
            None => Err(Error::NotFound),
        }
    }

    fn range<'a>(
        &'a self,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
    ) -> Box<dyn DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>> + 'a> {
        let file = Arc::clone(&self.file);
        Box::new(
            self.keydir
                .range((start, end))
                .map(move |(key, (pos, len))| Ok((key.clone(), read_value_at(&file, *pos, *len)?))),
        )
    }
}
