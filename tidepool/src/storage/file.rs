//! File-backed storage: one append-only log per object.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   <object id hex>.log      records framed by `record`
//!   <object id hex>.log.tmp  compaction in progress (discarded on open)
//! ```
//!
//! Each commit appends one record and syncs the file before returning.
//! When a log accumulates enough records relative to its live keys it is
//! rewritten as a single snapshot record. Objects with no keys and no alarm
//! have no file.
//!
//! A commit whose record would exceed the record size limit fails before
//! anything is written. A log whose snapshot would exceed it stays
//! uncompacted.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::data::ObjectData;
use super::record::{self, LogRecord, MAX_RECORD_SIZE};
use super::traits::{
    ms_to_time, CommitBatch, CommitOutcome, Entry, ListOptions, ObjectSummary, StorageBackend,
};
use crate::error::StorageError;
use crate::object::ObjectId;

const LOG_EXTENSION: &str = "log";
const TMP_SUFFIX: &str = ".tmp";

/// Default number of records after which a log is considered for compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 256;

#[derive(Debug)]
struct ObjectLog {
    path: PathBuf,
    data: ObjectData,
    /// Records currently in the file.
    records: usize,
    /// Record count below which compaction is not retried after a snapshot
    /// came out too large.
    compact_after: usize,
}

impl ObjectLog {
    fn empty(path: PathBuf, seq: u64) -> Self {
        Self {
            path,
            data: ObjectData::after(seq),
            records: 0,
            compact_after: 0,
        }
    }
}

type LogHandle = Arc<tokio::sync::Mutex<ObjectLog>>;

/// Storage backend persisting each object to its own log file.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    compaction_threshold: usize,
    max_record_size: usize,
    /// Highest sequence reached by an object whose file was removed for
    /// being empty. Objects without a file number their commits above it.
    retired_seq: AtomicU64,
    logs: parking_lot::Mutex<HashMap<ObjectId, LogHandle>>,
}

impl FileBackend {
    /// Open (creating if needed) a backend rooted at `root`.
    ///
    /// Leftover compaction files from an interrupted run are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut dir = fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                tracing::warn!(path = %path.display(), "removing stale compaction file");
                fs::remove_file(&path).await?;
            }
        }

        tracing::debug!(root = %root.display(), "opened file storage");
        Ok(Self {
            root,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            max_record_size: MAX_RECORD_SIZE,
            retired_seq: AtomicU64::new(0),
            logs: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Set the record count that triggers compaction.
    pub fn with_compaction_threshold(mut self, records: usize) -> Self {
        self.compaction_threshold = records.max(1);
        self
    }

    /// Set the largest record payload a commit may write, capped at 64 MiB.
    pub fn with_max_record_size(mut self, bytes: usize) -> Self {
        self.max_record_size = bytes.min(MAX_RECORD_SIZE);
        self
    }

    /// Directory holding the object logs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(format!("{}.{LOG_EXTENSION}", id.to_hex()))
    }

    fn handle(&self, id: &ObjectId) -> Option<LogHandle> {
        self.logs.lock().get(id).cloned()
    }

    /// Cached log for `id`, replaying it from disk on first access.
    async fn log(&self, id: &ObjectId) -> Result<LogHandle, StorageError> {
        if let Some(handle) = self.handle(id) {
            return Ok(handle);
        }

        let retired = self.retired_seq.load(Ordering::SeqCst);
        let loaded = Arc::new(tokio::sync::Mutex::new(
            load(self.log_path(id), retired).await?,
        ));
        // Another task may have loaded the same log meanwhile; keep the first.
        Ok(self
            .logs
            .lock()
            .entry(id.clone())
            .or_insert(loaded)
            .clone())
    }

    /// Forget the cached image so the next access reloads from disk.
    fn invalidate(&self, id: &ObjectId) {
        self.logs.lock().remove(id);
    }

    async fn write_commit(
        &self,
        log: &mut ObjectLog,
        seq: u64,
        batch: &CommitBatch,
        next: ObjectData,
    ) -> Result<(), StorageError> {
        if next.is_empty() {
            match fs::remove_file(&log.path).await {
                Ok(()) => sync_dir(&self.root).await?,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.retired_seq.fetch_max(seq, Ordering::SeqCst);
            *log = ObjectLog::empty(log.path.clone(), seq);
            return Ok(());
        }

        let created = log.records == 0;
        let framed = record::encode(
            &LogRecord::Commit {
                seq,
                mutations: batch.mutations.clone(),
            },
            self.max_record_size,
        )?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.path)
            .await?;
        file.write_all(&framed).await?;
        file.sync_data().await?;
        if created {
            sync_dir(&self.root).await?;
        }

        log.data = next;
        log.records += 1;

        if log.records >= self.compaction_threshold
            && log.records >= log.compact_after
            && log.records > log.data.entries.len().saturating_mul(2)
        {
            // The commit is already durable; a failed compaction leaves the
            // longer log in place.
            if let Err(e) = compact(&self.root, log, self.max_record_size).await {
                tracing::warn!(path = %log.path.display(), error = %e, "log compaction failed");
            }
        }
        Ok(())
    }
}

/// Replay the log at `path`, truncating any torn tail.
///
/// A missing file is an empty object numbering its commits after `retired`.
/// A bad record followed by intact ones is reported as corruption and the
/// file is left untouched.
async fn load(path: PathBuf, retired: u64) -> Result<ObjectLog, StorageError> {
    let buf = match fs::read(&path).await {
        Ok(buf) => buf,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(ObjectLog::empty(path, retired));
        }
        Err(e) => return Err(e.into()),
    };

    let replay = record::replay(&buf);
    if replay.stranded {
        let reason = replay
            .torn
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        tracing::error!(
            path = %path.display(),
            offset = replay.valid_len,
            %reason,
            "bad record in the middle of a log"
        );
        return Err(StorageError::Corrupt(format!(
            "{}: bad record at byte {} is followed by intact records ({reason})",
            path.display(),
            replay.valid_len
        )));
    }
    if let Some(reason) = &replay.torn {
        tracing::warn!(
            path = %path.display(),
            valid_len = replay.valid_len,
            discarded = buf.len() - replay.valid_len,
            %reason,
            "truncating torn log tail"
        );
        let file = OpenOptions::new().write(true).open(&path).await?;
        file.set_len(replay.valid_len as u64).await?;
        file.sync_all().await?;
    }

    Ok(ObjectLog {
        path,
        data: replay.data,
        records: replay.records,
        compact_after: 0,
    })
}

/// Rewrite `log` as a single snapshot record.
///
/// When the snapshot would exceed `limit` the log is kept as is, and the
/// next attempt waits until the log has doubled.
async fn compact(root: &Path, log: &mut ObjectLog, limit: usize) -> Result<(), StorageError> {
    let mut tmp = log.path.clone().into_os_string();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    let framed = match record::encode(&LogRecord::snapshot(&log.data), limit) {
        Ok(framed) => framed,
        Err(StorageError::RecordTooLarge { size, limit }) => {
            tracing::info!(
                path = %log.path.display(),
                size,
                limit,
                records = log.records,
                "snapshot too large for one record, skipping compaction"
            );
            log.compact_after = log.records.saturating_mul(2);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&framed).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, &log.path).await?;
    sync_dir(root).await?;

    tracing::debug!(
        path = %log.path.display(),
        records = log.records,
        keys = log.data.entries.len(),
        "compacted object log"
    );
    log.records = 1;
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn probe(&self) -> Result<(), StorageError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(StorageError::Unavailable(format!(
                "{}: {e}",
                self.root.display()
            ))),
        }
    }

    async fn read(
        &self,
        id: &ObjectId,
        keys: &[String],
    ) -> Result<Vec<Option<Entry>>, StorageError> {
        let log = self.log(id).await?;
        let log = log.lock().await;
        Ok(log.data.read(keys))
    }

    async fn list(
        &self,
        id: &ObjectId,
        options: &ListOptions,
    ) -> Result<Vec<(String, Entry)>, StorageError> {
        let log = self.log(id).await?;
        let log = log.lock().await;
        Ok(log.data.list(options))
    }

    async fn summary(&self, id: &ObjectId) -> Result<ObjectSummary, StorageError> {
        let log = self.log(id).await?;
        let log = log.lock().await;
        Ok(log.data.summary())
    }

    async fn commit(
        &self,
        id: &ObjectId,
        batch: CommitBatch,
    ) -> Result<CommitOutcome, StorageError> {
        let handle = self.log(id).await?;
        let mut log = handle.lock().await;

        if let Some(aborted) = log.data.check(&batch) {
            return Ok(aborted);
        }

        let seq = log.data.seq + 1;
        let mut next = log.data.clone();
        let deleted = next.apply(seq, &batch.mutations);

        if let Err(e) = self.write_commit(&mut log, seq, &batch, next).await {
            if let StorageError::RecordTooLarge { .. } = e {
                tracing::warn!(object = %id, error = %e, "commit rejected");
                return Err(e);
            }
            tracing::error!(object = %id, error = %e, "commit failed, dropping cached log");
            drop(log);
            self.invalidate(id);
            return Err(e);
        }

        Ok(CommitOutcome::Committed {
            version: seq,
            deleted,
        })
    }

    async fn scheduled_alarms(&self) -> Result<Vec<(ObjectId, SystemTime)>, StorageError> {
        let mut alarms = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| ObjectId::parse(s).ok())
            else {
                tracing::warn!(path = %path.display(), "skipping unrecognised file in storage root");
                continue;
            };

            let log = self.log(&id).await?;
            let log = log.lock().await;
            if let Some(ms) = log.data.alarm_ms {
                alarms.push((id, ms_to_time(ms)));
            }
        }

        Ok(alarms)
    }
}
