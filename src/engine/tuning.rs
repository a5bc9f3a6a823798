//! Advisory engine tuning, per §4.2. Tuning never changes correctness --
//! an engine (or a whole platform) that ignores it is still conformant, just
//! slower at the extremes. Grounded in the compaction-profile pattern other
//! embedded-engine wrappers use (e.g. a `CompactionProfile` selected by
//! estimated database size), generalized to the three discrete modes this
//! spec names.

use std::path::Path;

/// Tuning mode, selected by caller or derived from on-disk database size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tuning {
    /// Measure the database directory and pick `Small` or `Large`.
    Auto,
    Small,
    Large,
}

/// Resolved tuning parameters an engine adapter may consult. Units are bytes
/// except `l0_compaction_trigger`, a file count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineTuning {
    pub write_buffer_size: u64,
    pub block_size: u64,
    pub block_cache_size: u64,
    pub compaction_table_size: u64,
    pub compaction_table_size_multiplier: u32,
    pub l0_compaction_trigger: u32,
    /// Soft (`min-flush`) checkpoint threshold: below this batch size,
    /// `checkpoint()` is a no-op. §4.3.
    pub checkpoint_soft_bytes: usize,
    /// Hard (`max-flush`) threshold: at or above this batch size, `put`/
    /// `delete` trigger an unconditional flush. §4.3.
    pub checkpoint_hard_bytes: usize,
}

const SMALL: EngineTuning = EngineTuning {
    write_buffer_size: 4 << 20,
    block_size: 4 << 10,
    block_cache_size: 8 << 20,
    compaction_table_size: 2 << 20,
    compaction_table_size_multiplier: 4,
    l0_compaction_trigger: 4,
    checkpoint_soft_bytes: 16 << 10,
    checkpoint_hard_bytes: 256 << 10,
};

const LARGE: EngineTuning = EngineTuning {
    write_buffer_size: 64 << 20,
    block_size: 32 << 10,
    block_cache_size: 512 << 20,
    compaction_table_size: 32 << 20,
    compaction_table_size_multiplier: 10,
    l0_compaction_trigger: 8,
    checkpoint_soft_bytes: 64 << 10,
    checkpoint_hard_bytes: 1 << 20,
};

/// Database size, in bytes, above which `Tuning::Auto` selects `Large` on a
/// 64-bit platform.
const AUTO_LARGE_THRESHOLD: u64 = 1 << 30;

impl Tuning {
    /// Resolves this tuning mode to concrete parameters, measuring `dir` on
    /// disk if `self` is `Auto`.
    ///
    /// `wal_file_name`, when given, is excluded from the size measurement --
    /// the write-ahead log grows and shrinks independently of steady-state
    /// database size and would otherwise bias `Auto` towards `Large` right
    /// after a burst of writes.
    pub fn resolve(self, dir: &Path, wal_file_name: Option<&str>) -> EngineTuning {
        match self {
            Tuning::Small => SMALL,
            Tuning::Large => LARGE,
            Tuning::Auto => {
                if cfg!(target_pointer_width = "32") {
                    return SMALL;
                }
                let size = measure_dir_size(dir, wal_file_name);
                if size > AUTO_LARGE_THRESHOLD {
                    LARGE
                } else {
                    SMALL
                }
            }
        }
    }
}

/// Sums the sizes of regular files directly inside `dir`, skipping
/// `wal_file_name` if present. Missing directories measure as zero rather
/// than erroring -- this runs before the engine has necessarily created
/// anything on disk.
fn measure_dir_size(dir: &Path, wal_file_name: Option<&str>) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in entries.flatten() {
        if let Some(wal) = wal_file_name {
            if entry.file_name() == std::ffi::OsStr::new(wal) {
                continue;
            }
        }
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}
