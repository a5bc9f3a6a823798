//! Namespaced typed KV accessors over raw byte keys (§4.6), used for
//! per-device/per-folder statistics and the reserved `misc/` keys (§6.2).
//!
//! Each accessor is a thin direct-path wrapper: writes go through
//! `Backend::put`/`delete` (an implicit single-op transaction), reads
//! through `Backend::get`. Callers who need batching use the raw
//! transaction API (`Backend::new_write_transaction`) instead -- this layer
//! never buffers.

use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::{is_not_found, CResult};

/// A fixed key prefix under which a family of typed values lives, e.g.
/// `device/<id>/` or `misc/`.
pub struct Namespace<'b, E: Engine> {
    backend: &'b Backend<E>,
    prefix: &'static str,
}

impl<'b, E: Engine> Namespace<'b, E> {
    pub fn new(backend: &'b Backend<E>, prefix: &'static str) -> Self {
        Self { backend, prefix }
    }

    fn key(&self, name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + name.len());
        key.extend_from_slice(self.prefix.as_bytes());
        key.extend_from_slice(name.as_bytes());
        key
    }

    /// Returns `(value, present)`. A missing key reports `(default, false)`,
    /// never an error -- only engine failures propagate.
    pub fn get_string(&self, name: &str) -> CResult<(String, bool)> {
        match self.backend.get(&self.key(name)) {
            Ok(bytes) => Ok((String::from_utf8_lossy(&bytes).into_owned(), true)),
            Err(e) if is_not_found(&e) => Ok((String::new(), false)),
            Err(e) => Err(e),
        }
    }

    pub fn set_string(&self, name: &str, value: &str) -> CResult<()> {
        self.backend.put(&self.key(name), value.as_bytes().to_vec())
    }

    pub fn get_int64(&self, name: &str) -> CResult<(i64, bool)> {
        match self.backend.get(&self.key(name)) {
            Ok(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok((i64::from_be_bytes(buf), true))
            }
            Ok(_) => Ok((0, false)),
            Err(e) if is_not_found(&e) => Ok((0, false)),
            Err(e) => Err(e),
        }
    }

    pub fn set_int64(&self, name: &str, value: i64) -> CResult<()> {
        self.backend.put(&self.key(name), value.to_be_bytes().to_vec())
    }

    pub fn get_bool(&self, name: &str) -> CResult<(bool, bool)> {
        match self.backend.get(&self.key(name)) {
            Ok(bytes) if !bytes.is_empty() => Ok((bytes[0] != 0, true)),
            Ok(_) => Ok((false, false)),
            Err(e) if is_not_found(&e) => Ok((false, false)),
            Err(e) => Err(e),
        }
    }

    pub fn set_bool(&self, name: &str, value: bool) -> CResult<()> {
        self.backend.put(&self.key(name), vec![value as u8])
    }

    /// Nanoseconds since the Unix epoch. Distinguishes "never set" from
    /// epoch-zero via the `present` flag, not a sentinel value.
    pub fn get_time(&self, name: &str) -> CResult<(chrono::DateTime<chrono::Utc>, bool)> {
        let (nanos, present) = self.get_int64(name)?;
        if !present {
            return Ok((chrono::DateTime::<chrono::Utc>::UNIX_EPOCH, false));
        }
        let secs = nanos.div_euclid(1_000_000_000);
        let subsec_nanos = nanos.rem_euclid(1_000_000_000) as u32;
        let dt = chrono::DateTime::<chrono::Utc>::from_timestamp(secs, subsec_nanos)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
        Ok((dt, true))
    }

    pub fn set_time(&self, name: &str, value: chrono::DateTime<chrono::Utc>) -> CResult<()> {
        let nanos = value.timestamp_nanos_opt().unwrap_or(0);
        self.set_int64(name, nanos)
    }

    pub fn delete(&self, name: &str) -> CResult<()> {
        self.backend.delete(&self.key(name))
    }
}

/// The reserved `misc/` namespace (§6.2).
pub fn misc<E: Engine>(backend: &Backend<E>) -> Namespace<'_, E> {
    Namespace::new(backend, "misc/")
}

pub fn migrated_from_key(engine_name: &str) -> String {
    format!("migrated-from-{engine_name}-at")
}

pub fn migrated_by_key(engine_name: &str) -> String {
    format!("migrated-from-{engine_name}-by")
}

pub const PREV_VERSION_KEY: &str = "prevVersion";
pub const GLOBAL_MIGRATION_VERSION_KEY: &str = "globalMigrationVersion";
