//! Typed single-key state cell.
//!
//! `Persisted<T>` caches one deserialized value and the version it was read
//! at. [`save`](Persisted::save) is version-checked, so a cell that went
//! stale fails with [`StorageError::VersionMismatch`] instead of overwriting
//! a newer value.
//!
//! # Usage
//!
//! Objects typically load the cell lazily on their first turn and keep it
//! as a field:
//!
//! ```rust,ignore
//! #[derive(Default, Serialize, Deserialize)]
//! struct Account { balance: i64 }
//!
//! struct AccountObject { state: Option<Persisted<Account>> }
//!
//! #[async_trait]
//! impl ObjectBehavior for AccountObject {
//!     async fn invoke(&mut self, ctx: &ObjectContext, req: Request) -> Result<Response, InvocationFault> {
//!         if self.state.is_none() {
//!             self.state = Some(Persisted::load(ctx.storage().clone(), "account").await?);
//!         }
//!         let state = self.state.as_mut().ok_or_else(|| InvocationFault::failed("unloaded"))?;
//!         state.state_mut().balance += req.json_body::<i64>()?;
//!         state.save().await?;
//!         Ok(Response::json(&state.state().balance)?)
//!     }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::handle::Storage;
use super::traits::{CommitBatch, CommitOutcome, Mutation};
use crate::error::StorageError;

/// Typed persistent state stored under one key.
#[derive(Debug)]
pub struct Persisted<T> {
    value: T,
    version: Option<u64>,
    storage: Storage,
    key: String,
}

impl<T: Serialize + DeserializeOwned + Default> Persisted<T> {
    /// Load the value under `key`, or `T::default()` if there is none.
    pub async fn load(storage: Storage, key: impl Into<String>) -> Result<Self, StorageError> {
        let key = key.into();
        let (value, version) = match storage.get_entry(&key).await? {
            Some(entry) => (serde_json::from_value(entry.value)?, Some(entry.version)),
            None => (T::default(), None),
        };
        Ok(Self {
            value,
            version,
            storage,
            key,
        })
    }

    /// Current value.
    pub fn state(&self) -> &T {
        &self.value
    }

    /// Mutable access. Changes persist only on [`save`](Self::save).
    pub fn state_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Whether the value has been stored at least once.
    pub fn record_exists(&self) -> bool {
        self.version.is_some()
    }

    /// Version the cached value was read or written at.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Write the current value if storage still holds the version this cell
    /// last saw.
    pub async fn save(&mut self) -> Result<(), StorageError> {
        let value = serde_json::to_value(&self.value)?;
        let batch = CommitBatch {
            expectations: vec![(self.key.clone(), self.version)],
            mutations: vec![Mutation::Put {
                key: self.key.clone(),
                value,
            }],
        };
        self.version = Some(self.commit_checked(batch).await?);
        Ok(())
    }

    /// Replace the cached value with what storage holds.
    pub async fn reload(&mut self) -> Result<(), StorageError> {
        match self.storage.get_entry(&self.key).await? {
            Some(entry) => {
                self.value = serde_json::from_value(entry.value)?;
                self.version = Some(entry.version);
            }
            None => {
                self.value = T::default();
                self.version = None;
            }
        }
        Ok(())
    }

    /// Delete the stored value (version-checked) and reset to default.
    pub async fn clear(&mut self) -> Result<(), StorageError> {
        let batch = CommitBatch {
            expectations: vec![(self.key.clone(), self.version)],
            mutations: vec![Mutation::Delete {
                key: self.key.clone(),
            }],
        };
        self.commit_checked(batch).await?;
        self.value = T::default();
        self.version = None;
        Ok(())
    }

    async fn commit_checked(&self, batch: CommitBatch) -> Result<u64, StorageError> {
        match self.storage.commit(batch).await? {
            CommitOutcome::Committed { version, .. } => Ok(version),
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::Deserialize;

    use super::*;
    use crate::object::id_from_name;
    use crate::storage::{MemoryBackend, StorageBackend};

    #[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        count: i64,
        name: String,
    }

    fn storage() -> Storage {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        Storage::new(id_from_name("TEST", "alice").expect("valid name"), backend)
    }

    #[tokio::test]
    async fn test_load_new_state() {
        let cell = Persisted::<TestData>::load(storage(), "data")
            .await
            .expect("load should succeed");

        assert!(!cell.record_exists());
        assert!(cell.version().is_none());
        assert_eq!(cell.state(), &TestData::default());
    }

    #[tokio::test]
    async fn test_save_and_load_existing() {
        let s = storage();
        let mut cell = Persisted::<TestData>::load(s.clone(), "data")
            .await
            .expect("load");
        cell.state_mut().count = 42;
        cell.state_mut().name = "alice".into();
        cell.save().await.expect("save");
        assert!(cell.record_exists());

        let again = Persisted::<TestData>::load(s, "data").await.expect("load");
        assert_eq!(again.state().count, 42);
        assert_eq!(again.version(), cell.version());
    }

    #[tokio::test]
    async fn test_stale_save_is_rejected() {
        let s = storage();
        let mut first = Persisted::<TestData>::load(s.clone(), "data")
            .await
            .expect("load");
        let mut second = Persisted::<TestData>::load(s.clone(), "data")
            .await
            .expect("load");

        first.state_mut().count = 1;
        first.save().await.expect("first save");

        second.state_mut().count = 2;
        assert!(matches!(
            second.save().await,
            Err(StorageError::VersionMismatch { .. })
        ));

        second.reload().await.expect("reload");
        assert_eq!(second.state().count, 1);
        second.state_mut().count = 2;
        second.save().await.expect("save after reload");
    }

    #[tokio::test]
    async fn test_save_after_clear_and_rewrite_is_rejected() {
        let s = storage();
        let mut writer = Persisted::<TestData>::load(s.clone(), "data")
            .await
            .expect("load");
        writer.state_mut().count = 1;
        writer.save().await.expect("save");

        let mut stale = Persisted::<TestData>::load(s.clone(), "data")
            .await
            .expect("load");

        writer.clear().await.expect("clear");
        writer.state_mut().count = 2;
        writer.save().await.expect("save");
        assert_ne!(writer.version(), stale.version());

        stale.state_mut().count = 3;
        assert!(matches!(
            stale.save().await,
            Err(StorageError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_resets_to_default() {
        let s = storage();
        let mut cell = Persisted::<TestData>::load(s.clone(), "data")
            .await
            .expect("load");
        cell.state_mut().count = 7;
        cell.save().await.expect("save");

        cell.clear().await.expect("clear");
        assert!(!cell.record_exists());
        assert_eq!(cell.state().count, 0);
        assert_eq!(s.get::<TestData>("data").await.expect("get"), None);
    }
}
