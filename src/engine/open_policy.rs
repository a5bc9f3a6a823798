//! The opening policy shared by every on-disk engine adapter (§4.2):
//!
//! 1. Attempt a normal open.
//! 2. On `Corrupted`, attempt recovery.
//! 3. If recovery is also `Corrupted`, recreate the directory from scratch.
//! 4. Any other open error is surfaced with a human suggestion.
//!
//! Factored out so `LogCask` and `LegacyTable` share one implementation of
//! the policy instead of each reinventing the three-step dance.

use std::path::Path;

use crate::error::{CResult, Error};

/// Runs `open`, falling back to `recover` and finally a from-scratch
/// recreation of `dir` if corruption is reported at each stage in turn.
pub fn open_or_recreate<T>(
    dir: &Path,
    mut open: impl FnMut(&Path) -> CResult<T>,
    mut recover: impl FnMut(&Path) -> CResult<T>,
) -> CResult<T> {
    match open(dir) {
        Ok(engine) => Ok(engine),
        Err(Error::Corrupted(reason)) => {
            log::warn!(
                "database at {} reported corruption ({reason}), attempting recovery",
                dir.display()
            );
            match recover(dir) {
                Ok(engine) => Ok(engine),
                Err(Error::Corrupted(reason2)) => {
                    log::warn!(
                        "recovery of {} also failed ({reason2}); recreating the directory from scratch -- \
                         local state should be treated as lost and re-scanned",
                        dir.display()
                    );
                    match std::fs::remove_dir_all(dir) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    open(dir)
                }
                Err(other) => Err(other),
            }
        }
        Err(Error::Io(io_err)) => Err(Error::Internal(format!(
            "failed to open database at {}: {io_err} (is another instance running?)",
            dir.display()
        ))),
        Err(other) => Err(other),
    }
}
