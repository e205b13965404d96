//! Per-object storage handle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::traits::{
    time_to_ms, CommitBatch, CommitOutcome, Entry, ListOptions, Mutation, ObjectSummary,
    StorageBackend,
};
use super::transaction::{Transaction, TransactionOutcome, TxnOp};
use crate::error::StorageError;
use crate::object::ObjectId;

/// Durable key-value storage scoped to one object.
///
/// Every write awaits its commit before returning, so a later read, in the
/// same turn or a later one, observes it. Values are stored as JSON.
///
/// # Example
///
/// ```rust,ignore
/// let count: u64 = ctx.storage().get("count").await?.unwrap_or(0);
/// ctx.storage().put("count", &(count + 1)).await?;
/// ```
#[derive(Clone)]
pub struct Storage {
    id: ObjectId,
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    /// Handle for `id` on `backend`.
    pub fn new(id: ObjectId, backend: Arc<dyn StorageBackend>) -> Self {
        Self { id, backend }
    }

    /// The object this handle is scoped to.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Decode the value stored under `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get_entry(key).await? {
            Some(entry) => Ok(Some(serde_json::from_value(entry.value)?)),
            None => Ok(None),
        }
    }

    /// Raw entry for `key`, including its version.
    pub async fn get_entry(&self, key: &str) -> Result<Option<Entry>, StorageError> {
        let mut read = self.backend.read(&self.id, &[key.to_string()]).await?;
        Ok(read.pop().flatten())
    }

    /// Values of every present key among `keys`. Absent keys are omitted.
    pub async fn get_many<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<BTreeMap<String, Value>, StorageError> {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let read = self.backend.read(&self.id, &keys).await?;
        Ok(keys
            .into_iter()
            .zip(read)
            .filter_map(|(key, entry)| entry.map(|e| (key, e.value)))
            .collect())
    }

    /// Store `value` under `key`.
    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.apply(vec![Mutation::Put {
            key: key.to_string(),
            value,
        }])
        .await?;
        Ok(())
    }

    /// Store several values in one atomic commit.
    pub async fn put_many<I, K, T>(&self, entries: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Serialize,
    {
        let mutations = entries
            .into_iter()
            .map(|(key, value)| {
                Ok(Mutation::Put {
                    key: key.into(),
                    value: serde_json::to_value(&value)?,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        if mutations.is_empty() {
            return Ok(());
        }
        self.apply(mutations).await?;
        Ok(())
    }

    /// Remove `key`. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let deleted = self
            .apply(vec![Mutation::Delete {
                key: key.to_string(),
            }])
            .await?;
        Ok(deleted > 0)
    }

    /// Remove several keys in one atomic commit. Returns how many existed.
    pub async fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<usize, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mutations = keys
            .iter()
            .map(|k| Mutation::Delete {
                key: k.as_ref().to_string(),
            })
            .collect();
        self.apply(mutations).await
    }

    /// Remove every key. The alarm is kept.
    pub async fn delete_all(&self) -> Result<(), StorageError> {
        self.apply(vec![Mutation::DeleteAll]).await?;
        Ok(())
    }

    /// Keys and values selected by `options`, in key order.
    pub async fn list(&self, options: ListOptions) -> Result<Vec<(String, Value)>, StorageError> {
        let listed = self.backend.list(&self.id, &options).await?;
        Ok(listed.into_iter().map(|(k, e)| (k, e.value)).collect())
    }

    /// When the alarm is scheduled, if it is.
    pub async fn get_alarm(&self) -> Result<Option<SystemTime>, StorageError> {
        Ok(self.summary().await?.alarm)
    }

    /// Schedule the alarm, replacing any previous one.
    pub async fn set_alarm(&self, at: SystemTime) -> Result<(), StorageError> {
        self.apply(vec![Mutation::SetAlarm {
            at_ms: Some(time_to_ms(at)),
        }])
        .await?;
        Ok(())
    }

    /// Cancel the alarm. Cancelling when none is set is not an error.
    pub async fn delete_alarm(&self) -> Result<(), StorageError> {
        self.apply(vec![Mutation::SetAlarm { at_ms: None }]).await?;
        Ok(())
    }

    /// Key count and alarm.
    pub async fn summary(&self) -> Result<ObjectSummary, StorageError> {
        self.backend.summary(&self.id).await
    }

    /// Whether the object has no keys and no alarm.
    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.summary().await?.is_empty())
    }

    /// Check every [`TxnOp::Expect`] and apply every write as one commit.
    pub async fn transaction(&self, ops: Vec<TxnOp>) -> Result<TransactionOutcome, StorageError> {
        let mut batch = CommitBatch::default();
        for op in ops {
            match op {
                TxnOp::Put { key, value } => batch.mutations.push(Mutation::Put { key, value }),
                TxnOp::Delete { key } => batch.mutations.push(Mutation::Delete { key }),
                TxnOp::Expect { key, version } => batch.expectations.push((key, version)),
            }
        }
        self.commit(batch).await.map(TransactionOutcome::from)
    }

    /// Start an interactive transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    pub(crate) async fn probe(&self) -> Result<(), StorageError> {
        self.backend.probe().await
    }

    pub(crate) async fn commit(&self, batch: CommitBatch) -> Result<CommitOutcome, StorageError> {
        let outcome = self.backend.commit(&self.id, batch).await?;
        if let CommitOutcome::Aborted { key, .. } = &outcome {
            tracing::debug!(object = %self.id, %key, "commit aborted on expectation");
        }
        Ok(outcome)
    }

    /// Commit unconditional mutations, returning how many keys were removed.
    async fn apply(&self, mutations: Vec<Mutation>) -> Result<usize, StorageError> {
        match self.commit(CommitBatch::unconditional(mutations)).await? {
            CommitOutcome::Committed { deleted, .. } => Ok(deleted),
            CommitOutcome::Aborted {
                key,
                expected,
                actual,
            } => Err(StorageError::VersionMismatch {
                key,
                expected,
                actual,
            }),
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::object::id_from_name;
    use crate::storage::MemoryBackend;

    fn storage(name: &str, backend: &Arc<MemoryBackend>) -> Storage {
        Storage::new(
            id_from_name("TEST", name).expect("valid name"),
            backend.clone() as Arc<dyn StorageBackend>,
        )
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    #[tokio::test]
    async fn test_put_get_typed() {
        let backend = Arc::new(MemoryBackend::new());
        let s = storage("alice", &backend);

        let profile = Profile {
            name: "Alice".into(),
            visits: 3,
        };
        s.put("profile", &profile).await.expect("put");
        assert_eq!(s.get::<Profile>("profile").await.expect("get"), Some(profile));
        assert_eq!(s.get::<u64>("missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_get_with_wrong_type_is_codec_error() {
        let backend = Arc::new(MemoryBackend::new());
        let s = storage("alice", &backend);
        s.put("n", "not a number").await.expect("put");
        assert!(matches!(
            s.get::<u64>("n").await,
            Err(StorageError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_handles_are_scoped_to_their_object() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = storage("alice", &backend);
        let bob = storage("bob", &backend);

        alice.put("n", &1).await.expect("put");
        assert_eq!(bob.get::<i32>("n").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_many_and_delete() {
        let backend = Arc::new(MemoryBackend::new());
        let s = storage("alice", &backend);

        s.put_many([("a", 1), ("b", 2), ("c", 3)]).await.expect("put_many");
        let got = s.get_many(&["a", "c", "zz"]).await.expect("get_many");
        assert_eq!(got.len(), 2);
        assert_eq!(got["a"], json!(1));
        assert_eq!(got["c"], json!(3));

        assert!(s.delete("a").await.expect("delete"));
        assert!(!s.delete("a").await.expect("delete"));
        assert_eq!(s.delete_many(&["b", "c", "zz"]).await.expect("delete_many"), 2);
        assert!(s.is_empty().await.expect("is_empty"));
    }

    #[tokio::test]
    async fn test_list_returns_values_in_order() {
        let backend = Arc::new(MemoryBackend::new());
        let s = storage("alice", &backend);
        s.put_many([("user:2", "bob"), ("user:1", "ann"), ("other", "x")])
            .await
            .expect("put_many");

        let users = s
            .list(ListOptions::new().prefix("user:"))
            .await
            .expect("list");
        assert_eq!(
            users,
            vec![
                ("user:1".to_string(), json!("ann")),
                ("user:2".to_string(), json!("bob")),
            ]
        );
    }

    #[tokio::test]
    async fn test_alarm_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let s = storage("alice", &backend);

        assert_eq!(s.get_alarm().await.expect("get_alarm"), None);
        let at = UNIX_EPOCH + Duration::from_millis(1_800_000_000_000);
        s.set_alarm(at).await.expect("set_alarm");
        assert_eq!(s.get_alarm().await.expect("get_alarm"), Some(at));
        assert!(!s.is_empty().await.expect("is_empty"));

        s.delete_alarm().await.expect("delete_alarm");
        assert_eq!(s.get_alarm().await.expect("get_alarm"), None);
    }

    #[tokio::test]
    async fn test_delete_all_keeps_alarm() {
        let backend = Arc::new(MemoryBackend::new());
        let s = storage("alice", &backend);
        let at = UNIX_EPOCH + Duration::from_secs(10);

        s.put("n", &1).await.expect("put");
        s.set_alarm(at).await.expect("set_alarm");
        s.delete_all().await.expect("delete_all");

        assert_eq!(s.get::<i32>("n").await.expect("get"), None);
        assert_eq!(s.get_alarm().await.expect("get_alarm"), Some(at));
    }

    #[tokio::test]
    async fn test_transaction_ops() {
        let backend = Arc::new(MemoryBackend::new());
        let s = storage("alice", &backend);
        s.put("balance", &100).await.expect("put");
        let version = s
            .get_entry("balance")
            .await
            .expect("get_entry")
            .map(|e| e.version);

        let outcome = s
            .transaction(vec![
                TxnOp::expect("balance", version),
                TxnOp::put("balance", &70).expect("encode"),
                TxnOp::put("ledger:1", &30).expect("encode"),
            ])
            .await
            .expect("transaction");
        assert!(outcome.is_committed());

        // The stale version no longer matches.
        let outcome = s
            .transaction(vec![
                TxnOp::expect("balance", version),
                TxnOp::delete("balance"),
            ])
            .await
            .expect("transaction");
        assert!(matches!(outcome, TransactionOutcome::Aborted { .. }));
        assert_eq!(s.get::<i32>("balance").await.expect("get"), Some(70));
    }
}
