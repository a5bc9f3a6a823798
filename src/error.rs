//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`CResult<T>`], an alias for
//! `Result<T, Error>`. Two predicates, [`is_closed`] and [`is_not_found`], let
//! callers distinguish the two "expected" error kinds from everything else
//! without matching on the enum directly, so that wrapping an `Error` inside
//! another layer's error type (e.g. via `Box<dyn std::error::Error>`) doesn't
//! break the check as long as the source chain is preserved.

use std::fmt;

/// The result type used throughout this crate.
pub type CResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Returned by any operation attempted after `close()` has been called,
    /// or that began while close was already in progress.
    Closed,

    /// Returned by `get` (and anything built on it) when the key is absent.
    /// The dominant "expected" error; most callers test for it explicitly
    /// rather than treat it as failure.
    NotFound,

    /// The on-disk engine reported unrecoverable corruption. The opening
    /// policy in `engine::open_policy` reacts to this by attempting recovery
    /// and, failing that, recreating the directory from scratch.
    Corrupted(String),

    /// A commit hook returned an error while a checkpoint or commit was
    /// flushing. The batch is left intact; the transaction remains usable.
    Hook(Box<Error>),

    /// Any other engine or I/O failure, with a human-readable message and,
    /// for I/O-rooted errors, the original `io::Error` preserved as `source`.
    Internal(String),

    Io(std::io::Error),

    Encoding(bincode::Error),
}

impl Error {
    /// A value error, for malformed input (oversized keys/values, bad
    /// typed-KV encodings) rather than engine or I/O failure.
    pub fn value(msg: impl Into<String>) -> Error {
        Error::Internal(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "backend is closed"),
            Error::NotFound => write!(f, "key not found"),
            Error::Corrupted(msg) => write!(f, "corrupted database: {msg}"),
            Error::Hook(inner) => write!(f, "commit hook failed: {inner}"),
            Error::Internal(msg) => write!(f, "{msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Encoding(err) => write!(f, "encoding error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Hook(inner) => Some(inner.as_ref()),
            Error::Io(err) => Some(err),
            Error::Encoding(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Encoding(err)
    }
}

/// Walks `error`'s source chain (including itself) looking for
/// `Error::Closed`. Exported so callers can recognize a closed backend even
/// through a layer that wraps this crate's `Error` in its own type.
pub fn is_closed(error: &(dyn std::error::Error + 'static)) -> bool {
    chain(error).any(|e| matches!(e.downcast_ref::<Error>(), Some(Error::Closed)))
}

/// Walks `error`'s source chain (including itself) looking for
/// `Error::NotFound`.
pub fn is_not_found(error: &(dyn std::error::Error + 'static)) -> bool {
    chain(error).any(|e| matches!(e.downcast_ref::<Error>(), Some(Error::NotFound)))
}

fn chain(error: &(dyn std::error::Error + 'static)) -> impl Iterator<Item = &(dyn std::error::Error + 'static)> {
    std::iter::successors(Some(error), |e| e.source())
}
