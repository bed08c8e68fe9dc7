//! Persistent session backend.
//!
//! Everything above this crate talks to a [`KvBackend`]: a key/value store
//! with per-key TTL, a compare-and-swap keyed on the version embedded in a
//! JSON value, secondary-index sets, prefix scans and append-only lists.
//! Two implementations exist, durable sqlite and an in-process map, plus
//! a [`DegradableBackend`] combinator that falls back from the former to
//! the latter and exposes a degraded-mode flag for alerting.

pub mod backend;
pub mod degradable;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use backend::{CasOutcome, KvBackend};
pub use degradable::DegradableBackend;
pub use error::{Result, StorageError};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
