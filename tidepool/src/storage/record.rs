//! On-disk record format for per-object logs.
//!
//! Record format: `[length:4][checksum:4][payload:N]`
//!
//! - **length**: Payload size in bytes (little-endian u32)
//! - **checksum**: CRC32C of the payload
//! - **payload**: JSON-encoded [`LogRecord`]
//!
//! A log is a sequence of records. Replay stops at the first record that is
//! incomplete or fails its checksum; everything before it is the durable
//! state. A bad record at the end is a torn write to discard. A bad record
//! with intact records after it is corruption, and replay reports it as
//! such.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::data::ObjectData;
use super::traits::{Entry, Mutation};
use crate::error::StorageError;

/// Header size: 4 (length) + 4 (checksum) = 8 bytes.
pub(crate) const HEADER_SIZE: usize = 8;

/// Maximum payload size (64MB).
pub(crate) const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Record framing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum FrameError {
    /// Not enough data to parse the record.
    #[error("truncated record: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Length field exceeds the maximum record size.
    #[error("record too large: {size} bytes (max 64 MiB)")]
    TooLarge { size: usize },

    /// Checksum matched but the payload did not decode.
    #[error("undecodable record: {0}")]
    Undecodable(String),
}

/// One entry of an object's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum LogRecord {
    /// A committed batch.
    Commit { seq: u64, mutations: Vec<Mutation> },
    /// Full state as of `seq`. Written at the head of a compacted log.
    Snapshot {
        seq: u64,
        entries: BTreeMap<String, Entry>,
        alarm_ms: Option<u64>,
    },
}

impl LogRecord {
    pub(crate) fn snapshot(data: &ObjectData) -> Self {
        LogRecord::Snapshot {
            seq: data.seq,
            entries: data.entries.clone(),
            alarm_ms: data.alarm_ms,
        }
    }

    /// Fold this record into `data`.
    pub(crate) fn apply_to(self, data: &mut ObjectData) {
        match self {
            LogRecord::Commit { seq, mutations } => {
                data.apply(seq, &mutations);
            }
            LogRecord::Snapshot {
                seq,
                entries,
                alarm_ms,
            } => {
                data.entries = entries;
                data.alarm_ms = alarm_ms;
                data.seq = seq;
            }
        }
    }
}

/// Frame `record` for appending to a log.
///
/// Payloads over `limit` (itself capped at [`MAX_RECORD_SIZE`]) are
/// rejected, since replay would refuse them.
pub(crate) fn encode(record: &LogRecord, limit: usize) -> Result<Vec<u8>, StorageError> {
    let payload = serde_json::to_vec(record)?;
    let limit = limit.min(MAX_RECORD_SIZE);
    if payload.len() > limit {
        return Err(StorageError::RecordTooLarge {
            size: payload.len(),
            limit,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode the record at the start of `buf`, returning it and its framed size.
pub(crate) fn decode(buf: &[u8]) -> Result<(LogRecord, usize), FrameError> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::Truncated {
            needed: HEADER_SIZE,
            have: buf.len(),
        });
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let expected = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if length > MAX_RECORD_SIZE {
        return Err(FrameError::TooLarge { size: length });
    }
    let total = HEADER_SIZE + length;
    if buf.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            have: buf.len(),
        });
    }

    let payload = &buf[HEADER_SIZE..total];
    let actual = crc32c::crc32c(payload);
    if actual != expected {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let record = serde_json::from_slice(payload)
        .map_err(|e| FrameError::Undecodable(e.to_string()))?;
    Ok((record, total))
}

/// Result of replaying a log buffer.
#[derive(Debug)]
pub(crate) struct Replay {
    pub(crate) data: ObjectData,
    /// Number of leading bytes made of intact records.
    pub(crate) valid_len: usize,
    /// Number of intact records.
    pub(crate) records: usize,
    /// Why replay stopped early, if it did.
    pub(crate) torn: Option<FrameError>,
    /// The record replay stopped at is followed by intact records.
    pub(crate) stranded: bool,
}

/// Rebuild an object's state from its log bytes.
pub(crate) fn replay(buf: &[u8]) -> Replay {
    let mut data = ObjectData::default();
    let mut offset = 0;
    let mut records = 0;
    let mut torn = None;
    let mut stranded = false;

    while offset < buf.len() {
        match decode(&buf[offset..]) {
            Ok((record, size)) => {
                record.apply_to(&mut data);
                offset += size;
                records += 1;
            }
            Err(e) => {
                stranded = matches!(
                    e,
                    FrameError::ChecksumMismatch { .. } | FrameError::Undecodable(_)
                ) && intact_record_follows(&buf[offset..]);
                torn = Some(e);
                break;
            }
        }
    }

    Replay {
        data,
        valid_len: offset,
        records,
        torn,
        stranded,
    }
}

/// Whether a decodable record starts right after the complete but bad
/// record at the start of `buf`.
fn intact_record_follows(buf: &[u8]) -> bool {
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    buf.get(HEADER_SIZE + length..)
        .map_or(false, |rest| decode(rest).is_ok())
}
