//! An embedded, ordered key-value store with snapshot-isolated read
//! transactions and buffered write transactions.
//!
//! Three components sit on top of an [`engine::Engine`] implementation:
//! [`backend::Backend`] (the caller-facing surface), [`txn`] (snapshot and
//! batch fusion, checkpoint/commit policy), and [`lifecycle`] (close-aware
//! reference counting so `Backend::close` never races a live transaction).
//! [`migration`] and [`kv_typed`] are built entirely on top of those three
//! and never touch an engine directly.

pub mod backend;
pub mod engine;
pub mod error;
pub mod kv_typed;
pub mod lifecycle;
pub mod migration;
pub mod txn;
pub mod util;

pub use backend::{open, open_in_memory, open_legacy, Backend, DynBackend};
pub use engine::tuning::Tuning;
pub use error::{is_closed, is_not_found, CResult, Error};
