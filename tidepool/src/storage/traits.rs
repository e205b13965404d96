//! Storage backend trait and the types that cross it.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;
use crate::object::ObjectId;

/// A stored value together with the version of the commit that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The stored value.
    pub value: Value,
    /// Sequence number of the commit that last wrote this key.
    pub version: u64,
}

/// One write inside a [`CommitBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Set `key` to `value`.
    Put {
        /// Key to write.
        key: String,
        /// New value.
        value: Value,
    },
    /// Remove `key`. Removing an absent key is not an error.
    Delete {
        /// Key to remove.
        key: String,
    },
    /// Remove every key of the object. The alarm is left alone.
    DeleteAll,
    /// Set (`Some`) or clear (`None`) the alarm, in milliseconds since the epoch.
    SetAlarm {
        /// Alarm time in milliseconds since the Unix epoch.
        at_ms: Option<u64>,
    },
}

/// An atomic unit of writes for one object.
///
/// Every expectation must hold for any mutation to apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    /// `(key, version)` pairs. `None` expects the key to be absent.
    pub expectations: Vec<(String, Option<u64>)>,
    /// Writes applied in order.
    pub mutations: Vec<Mutation>,
}

impl CommitBatch {
    /// Batch with no expectations.
    pub fn unconditional(mutations: Vec<Mutation>) -> Self {
        Self {
            expectations: Vec::new(),
            mutations,
        }
    }

    /// Whether the batch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Result of [`StorageBackend::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// All mutations applied.
    Committed {
        /// Version assigned to the keys written by this commit.
        version: u64,
        /// Number of keys that existed and were removed.
        deleted: usize,
    },
    /// An expectation failed; nothing applied.
    Aborted {
        /// Key whose expectation failed.
        key: String,
        /// Version the batch expected.
        expected: Option<u64>,
        /// Version actually stored.
        actual: Option<u64>,
    },
}

/// Range selection for [`StorageBackend::list`].
///
/// Keys are ordered by their UTF-8 bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// Inclusive lower bound.
    pub start: Option<String>,
    /// Exclusive upper bound.
    pub end: Option<String>,
    /// Maximum number of entries returned.
    pub limit: Option<usize>,
    /// Walk keys in descending order.
    pub reverse: bool,
}

impl ListOptions {
    /// Select every key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to keys starting with `prefix`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the inclusive lower bound.
    pub fn start(mut self, start: impl Into<String>) -> Self {
        self.start = Some(start.into());
        self
    }

    /// Set the exclusive upper bound.
    pub fn end(mut self, end: impl Into<String>) -> Self {
        self.end = Some(end.into());
        self
    }

    /// Cap the number of entries.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Walk keys in descending order.
    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }
}

/// Cheap description of an object's stored state, used for eviction
/// decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Number of stored keys.
    pub keys: usize,
    /// Pending alarm, if any.
    pub alarm: Option<SystemTime>,
}

impl ObjectSummary {
    /// No keys and no alarm.
    pub fn is_empty(&self) -> bool {
        self.keys == 0 && self.alarm.is_none()
    }
}

/// Durable key-value storage, partitioned by object id.
///
/// Every method addresses exactly one object; nothing is shared between
/// objects. A successful [`commit`](Self::commit) is durable before it
/// returns.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Check that the backend can serve requests.
    ///
    /// Called before an instance is constructed. An error keeps the instance
    /// uninitialized.
    async fn probe(&self) -> Result<(), StorageError>;

    /// Read `keys`, returning one slot per key in the same order.
    async fn read(&self, id: &ObjectId, keys: &[String])
        -> Result<Vec<Option<Entry>>, StorageError>;

    /// Read a range of keys in order.
    async fn list(
        &self,
        id: &ObjectId,
        options: &ListOptions,
    ) -> Result<Vec<(String, Entry)>, StorageError>;

    /// Key count and alarm of `id`.
    async fn summary(&self, id: &ObjectId) -> Result<ObjectSummary, StorageError>;

    /// Atomically check expectations and apply mutations.
    ///
    /// Either all mutations become durable or none do.
    async fn commit(&self, id: &ObjectId, batch: CommitBatch)
        -> Result<CommitOutcome, StorageError>;

    /// Every object with a pending alarm.
    ///
    /// Used at startup to wake objects whose alarms outlived the process.
    async fn scheduled_alarms(&self) -> Result<Vec<(ObjectId, SystemTime)>, StorageError>;
}

pub(crate) fn time_to_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn ms_to_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_wire_shape() {
        let m = Mutation::Put {
            key: "count".into(),
            value: serde_json::json!(3),
        };
        let encoded = serde_json::to_value(&m).expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({"op": "put", "key": "count", "value": 3})
        );

        let cleared: Mutation =
            serde_json::from_value(serde_json::json!({"op": "set_alarm", "at_ms": null}))
                .expect("decode");
        assert_eq!(cleared, Mutation::SetAlarm { at_ms: None });
    }

    #[test]
    fn test_alarm_time_millis() {
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(time_to_ms(at), 1_700_000_000_123);
        assert_eq!(ms_to_time(time_to_ms(at)), at);
        // Before the epoch clamps to zero.
        assert_eq!(time_to_ms(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }
}
