//! Durable per-object storage.
//!
//! - [`StorageBackend`]: trait for a storage region, partitioned by object id
//! - [`MemoryBackend`]: in-memory backend for tests
//! - [`FileBackend`]: one fsynced append-only log per object
//! - [`Storage`]: the handle an object sees, scoped to its own id
//! - [`Transaction`] and [`TxnOp`]: atomic multi-key writes
//! - [`Persisted`]: typed single-key state cell

mod data;
pub mod file;
mod handle;
pub mod memory;
mod persistent;
mod record;
mod traits;
mod transaction;

pub use file::FileBackend;
pub use handle::Storage;
pub use memory::MemoryBackend;
pub use persistent::Persisted;
pub use traits::{
    CommitBatch, CommitOutcome, Entry, ListOptions, Mutation, ObjectSummary, StorageBackend,
};
pub use transaction::{Transaction, TransactionOutcome, TxnOp};

pub(crate) use traits::{ms_to_time, time_to_ms};
