//! In-memory storage backend for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::data::ObjectData;
use super::traits::{
    ms_to_time, CommitBatch, CommitOutcome, Entry, ListOptions, ObjectSummary, StorageBackend,
};
use crate::error::StorageError;
use crate::object::ObjectId;

/// Storage backend keeping every object in a `HashMap`.
///
/// State is lost when the backend is dropped. Availability can be toggled
/// with [`set_available`](Self::set_available) to exercise failure paths.
#[derive(Debug)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<ObjectId, ObjectData>>,
    /// Highest sequence reached by an object that was dropped for being
    /// empty. New objects number their commits above it.
    retired_seq: AtomicU64,
    available: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty, available backend.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            retired_seq: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Make every operation succeed (`true`) or fail with
    /// [`StorageError::Unavailable`] (`false`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of objects with stored keys or a pending alarm.
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory backend disabled".into()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn probe(&self) -> Result<(), StorageError> {
        self.ensure_available()
    }

    async fn read(
        &self,
        id: &ObjectId,
        keys: &[String],
    ) -> Result<Vec<Option<Entry>>, StorageError> {
        self.ensure_available()?;
        Ok(match self.objects.lock().get(id) {
            Some(data) => data.read(keys),
            None => vec![None; keys.len()],
        })
    }

    async fn list(
        &self,
        id: &ObjectId,
        options: &ListOptions,
    ) -> Result<Vec<(String, Entry)>, StorageError> {
        self.ensure_available()?;
        Ok(self
            .objects
            .lock()
            .get(id)
            .map(|data| data.list(options))
            .unwrap_or_default())
    }

    async fn summary(&self, id: &ObjectId) -> Result<ObjectSummary, StorageError> {
        self.ensure_available()?;
        Ok(self
            .objects
            .lock()
            .get(id)
            .map(ObjectData::summary)
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        id: &ObjectId,
        batch: CommitBatch,
    ) -> Result<CommitOutcome, StorageError> {
        self.ensure_available()?;
        let mut objects = self.objects.lock();
        let data = objects
            .entry(id.clone())
            .or_insert_with(|| ObjectData::after(self.retired_seq.load(Ordering::SeqCst)));
        let outcome = data.commit(&batch);
        if data.is_empty() {
            self.retired_seq.fetch_max(data.seq, Ordering::SeqCst);
            objects.remove(id);
        }
        Ok(outcome)
    }

    async fn scheduled_alarms(&self) -> Result<Vec<(ObjectId, SystemTime)>, StorageError> {
        self.ensure_available()?;
        Ok(self
            .objects
            .lock()
            .iter()
            .filter_map(|(id, data)| data.alarm_ms.map(|ms| (id.clone(), ms_to_time(ms))))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::object::id_from_name;
    use crate::storage::Mutation;

    fn id(name: &str) -> ObjectId {
        id_from_name("TEST", name).expect("valid name")
    }

    fn put(key: &str, value: serde_json::Value) -> Mutation {
        Mutation::Put {
            key: key.into(),
            value,
        }
    }

    #[tokio::test]
    async fn test_memory_backend_commit_and_read() {
        let backend = MemoryBackend::new();
        let alice = id("alice");

        let outcome = backend
            .commit(&alice, CommitBatch::unconditional(vec![put("n", json!(1))]))
            .await
            .expect("commit");
        assert_eq!(outcome, CommitOutcome::Committed { version: 1, deleted: 0 });

        let read = backend.read(&alice, &["n".into()]).await.expect("read");
        assert_eq!(read[0].as_ref().map(|e| &e.value), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_memory_backend_objects_are_isolated() {
        let backend = MemoryBackend::new();
        backend
            .commit(&id("alice"), CommitBatch::unconditional(vec![put("n", json!(1))]))
            .await
            .expect("commit");

        let read = backend.read(&id("bob"), &["n".into()]).await.expect("read");
        assert_eq!(read, vec![None]);
        assert_eq!(
            backend.summary(&id("bob")).await.expect("summary"),
            ObjectSummary::default()
        );
    }

    #[tokio::test]
    async fn test_memory_backend_drops_empty_objects() {
        let backend = MemoryBackend::new();
        let alice = id("alice");
        backend
            .commit(&alice, CommitBatch::unconditional(vec![put("n", json!(1))]))
            .await
            .expect("commit");
        assert_eq!(backend.object_count(), 1);

        backend
            .commit(&alice, CommitBatch::unconditional(vec![Mutation::DeleteAll]))
            .await
            .expect("commit");
        assert_eq!(backend.object_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_backend_versions_outlive_empty_objects() {
        let backend = MemoryBackend::new();
        let alice = id("alice");
        backend
            .commit(&alice, CommitBatch::unconditional(vec![put("n", json!(1))]))
            .await
            .expect("commit");
        backend
            .commit(&alice, CommitBatch::unconditional(vec![Mutation::DeleteAll]))
            .await
            .expect("commit");

        let outcome = backend
            .commit(&alice, CommitBatch::unconditional(vec![put("n", json!(2))]))
            .await
            .expect("commit");
        assert_eq!(outcome, CommitOutcome::Committed { version: 3, deleted: 0 });

        // A writer that saw the first `n` must not match the new one.
        let stale = backend
            .commit(
                &alice,
                CommitBatch {
                    expectations: vec![("n".into(), Some(1))],
                    mutations: vec![put("n", json!(9))],
                },
            )
            .await
            .expect("commit");
        assert_eq!(
            stale,
            CommitOutcome::Aborted {
                key: "n".into(),
                expected: Some(1),
                actual: Some(3),
            }
        );
    }

    #[tokio::test]
    async fn test_memory_backend_unavailable() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert!(matches!(
            backend.probe().await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(backend
            .commit(&id("alice"), CommitBatch::unconditional(vec![put("n", json!(1))]))
            .await
            .is_err());

        backend.set_available(true);
        assert!(backend.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_backend_scheduled_alarms() {
        let backend = MemoryBackend::new();
        backend
            .commit(
                &id("alice"),
                CommitBatch::unconditional(vec![Mutation::SetAlarm { at_ms: Some(1_000) }]),
            )
            .await
            .expect("commit");

        let alarms = backend.scheduled_alarms().await.expect("scan");
        assert_eq!(alarms, vec![(id("alice"), ms_to_time(1_000))]);
    }
}
