//! Atomic multi-key writes.
//!
//! Two forms:
//!
//! - [`Storage::transaction`](super::Storage::transaction) takes a list of
//!   [`TxnOp`]s and commits them as one batch.
//! - [`Storage::begin`](super::Storage::begin) returns an interactive
//!   [`Transaction`] that buffers writes, serves reads from the buffer first,
//!   and records the version of every key it reads from storage. On
//!   [`commit`](Transaction::commit) those versions become expectations, so
//!   the commit aborts if any key it read has changed.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::handle::Storage;
use super::traits::{CommitBatch, CommitOutcome, Mutation};
use crate::error::StorageError;

/// One step of [`Storage::transaction`](super::Storage::transaction).
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOp {
    /// Write `value` under `key`.
    Put {
        /// Key to write.
        key: String,
        /// JSON value.
        value: Value,
    },
    /// Remove `key`.
    Delete {
        /// Key to remove.
        key: String,
    },
    /// Require `key` to be at `version` (`None`: absent) when the batch commits.
    Expect {
        /// Key to check.
        key: String,
        /// Expected version.
        version: Option<u64>,
    },
}

impl TxnOp {
    /// Encode `value` into a `Put`.
    pub fn put<T: Serialize + ?Sized>(
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(TxnOp::Put {
            key: key.into(),
            value: serde_json::to_value(value)?,
        })
    }

    /// A `Delete` of `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    /// An `Expect` on `key`.
    pub fn expect(key: impl Into<String>, version: Option<u64>) -> Self {
        TxnOp::Expect {
            key: key.into(),
            version,
        }
    }
}

/// Result of a transaction commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Every write applied atomically.
    Committed {
        /// Version assigned to the written keys.
        version: u64,
    },
    /// An expectation failed and nothing was written.
    Aborted {
        /// Key whose expectation failed.
        key: String,
        /// Version the transaction expected.
        expected: Option<u64>,
        /// Version found in storage.
        actual: Option<u64>,
    },
}

impl TransactionOutcome {
    /// Whether the writes were applied.
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }
}

impl From<CommitOutcome> for TransactionOutcome {
    fn from(outcome: CommitOutcome) -> Self {
        match outcome {
            CommitOutcome::Committed { version, .. } => TransactionOutcome::Committed { version },
            CommitOutcome::Aborted {
                key,
                expected,
                actual,
            } => TransactionOutcome::Aborted {
                key,
                expected,
                actual,
            },
        }
    }
}

/// Interactive transaction over one object's storage.
///
/// Nothing reaches storage until [`commit`](Self::commit). Dropping the
/// transaction, or calling [`rollback`](Self::rollback), discards it.
#[derive(Debug)]
pub struct Transaction {
    storage: Storage,
    /// Versions observed by reads that went to storage.
    reads: BTreeMap<String, Option<u64>>,
    /// Pending writes; `None` is a delete.
    writes: BTreeMap<String, Option<Value>>,
}

impl Transaction {
    pub(crate) fn new(storage: Storage) -> Self {
        Self {
            storage,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Read `key`, seeing this transaction's own pending writes.
    pub async fn get<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, StorageError> {
        if let Some(pending) = self.writes.get(key) {
            return match pending {
                Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
                None => Ok(None),
            };
        }

        let entry = self.storage.get_entry(key).await?;
        self.reads
            .entry(key.to_string())
            .or_insert(entry.as_ref().map(|e| e.version));
        match entry {
            Some(entry) => Ok(Some(serde_json::from_value(entry.value)?)),
            None => Ok(None),
        }
    }

    /// Stage a write.
    pub fn put<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    /// Stage a delete.
    pub fn delete(&mut self, key: &str) {
        self.writes.insert(key.to_string(), None);
    }

    /// Whether no writes are staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Discard every staged write.
    pub fn rollback(self) {
        tracing::trace!(
            object = %self.storage.id(),
            staged = self.writes.len(),
            "transaction rolled back"
        );
    }

    /// Check every read version and apply every staged write atomically.
    ///
    /// A read-only transaction still checks its reads.
    pub async fn commit(self) -> Result<TransactionOutcome, StorageError> {
        let batch = CommitBatch {
            expectations: self.reads.into_iter().collect(),
            mutations: self
                .writes
                .into_iter()
                .map(|(key, value)| match value {
                    Some(value) => Mutation::Put { key, value },
                    None => Mutation::Delete { key },
                })
                .collect(),
        };
        self.storage.commit(batch).await.map(TransactionOutcome::from)
    }
}
