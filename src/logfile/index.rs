//! Index sidecar: the position and time span of every cycle of a log file.

use std::fs::{self, File};
use std::io::{BufReader, Seek, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{
  CYCLE_END, CYCLE_INFO_END, CYCLE_INFO_INDEX, CYCLE_INFO_START, INDEX_ENVELOPE_VERSION,
};
use crate::error::{PlanLogError, Result};
use crate::types::Timestamp;

use super::format::read_prologue;
use super::reader::{read_chunk, Reader};
use super::record::{decode_cycle, LogRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
  /// Offset of the chunk length field
  pub pos: u64,
  pub cycle_index: u64,
  pub start: Timestamp,
  /// Cycle duration in microseconds, when the cycle carries a `cycle_end`
  pub end: Option<u64>,
  pub record_count: u64,
}

impl IndexEntry {
  pub fn end_time(&self) -> Timestamp {
    self.start.add_micros(self.end.unwrap_or(0))
  }
}

/// Size and modification time of the log file an index was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSignature {
  pub size: u64,
  pub modified_sec: u64,
  pub modified_nsec: u32,
}

impl LogSignature {
  pub fn of(path: &Path) -> Result<Self> {
    let metadata = fs::metadata(path)?;
    let modified = metadata
      .modified()?
      .duration_since(std::time::UNIX_EPOCH)
      .unwrap_or_default();
    Ok(Self {
      size: metadata.len(),
      modified_sec: modified.as_secs(),
      modified_nsec: modified.subsec_nanos(),
    })
  }
}

/// Sidecar layout. `payload` holds the JSON of the [`Index`] so the checksum
/// covers the exact bytes on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEnvelope {
  version: u32,
  payload_crc32: u32,
  payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
  signature: LogSignature,
  entries: Vec<IndexEntry>,
  #[serde(default)]
  truncated_at: Option<u64>,
}

impl Index {
  /// Index the log file read by `reader`. The reader's position is not
  /// changed.
  pub fn rebuild(reader: &Reader) -> Result<Index> {
    Self::scan(reader.path())
  }

  /// Index `log` and write the result to `idx`.
  ///
  /// A trailing partial chunk is not indexed. Its offset is kept in
  /// [`Index::truncated_at`], since reading the log there fails with
  /// [`PlanLogError::TruncatedFile`].
  pub fn rebuild_file(log: impl AsRef<Path>, idx: impl AsRef<Path>) -> Result<Index> {
    let index = Self::scan(log.as_ref())?;
    index.write(idx)?;
    Ok(index)
  }

  fn scan(log: &Path) -> Result<Index> {
    // Bytes appended during the scan are left out and make the index stale.
    let signature = LogSignature::of(log)?;
    let mut input = BufReader::new(File::open(log)?);
    read_prologue(&mut input)?;

    let mut entries = Vec::new();
    let mut truncated_at = None;
    loop {
      let pos = input.stream_position()?;
      let payload = match read_chunk(&mut input) {
        Ok(Some(payload)) => payload,
        Ok(None) => break,
        Err(PlanLogError::TruncatedFile(reason)) => {
          tracing::warn!(path = %log.display(), pos, "not indexing trailing partial chunk: {reason}");
          truncated_at = Some(pos);
          break;
        }
        Err(err) => return Err(err),
      };
      if input.stream_position()? > signature.size {
        break;
      }
      let records = decode_cycle(&payload)?;
      entries.push(entry_for(pos, entries.len() as u64, &records));
    }

    Ok(Index {
      signature,
      entries,
      truncated_at,
    })
  }

  pub fn read(idx: impl AsRef<Path>) -> Result<Index> {
    let bytes = fs::read(idx.as_ref())?;
    let envelope: IndexEnvelope = serde_json::from_slice(&bytes)
      .map_err(|error| PlanLogError::Serialization(format!("decode index envelope: {error}")))?;
    if envelope.version != INDEX_ENVELOPE_VERSION {
      return Err(PlanLogError::VersionMismatch {
        required: envelope.version,
        current: INDEX_ENVELOPE_VERSION,
      });
    }
    let computed = crc32fast::hash(envelope.payload.as_bytes());
    if computed != envelope.payload_crc32 {
      return Err(PlanLogError::CrcMismatch {
        stored: envelope.payload_crc32,
        computed,
      });
    }
    serde_json::from_str(&envelope.payload)
      .map_err(|error| PlanLogError::Serialization(format!("decode index payload: {error}")))
  }

  /// Write through a temporary file renamed over `idx`.
  pub fn write(&self, idx: impl AsRef<Path>) -> Result<()> {
    let idx = idx.as_ref();
    let payload = serde_json::to_string(self)
      .map_err(|error| PlanLogError::Serialization(format!("encode index payload: {error}")))?;
    let envelope = IndexEnvelope {
      version: INDEX_ENVELOPE_VERSION,
      payload_crc32: crc32fast::hash(payload.as_bytes()),
      payload,
    };
    let bytes = serde_json::to_vec(&envelope)
      .map_err(|error| PlanLogError::Serialization(format!("encode index envelope: {error}")))?;

    let temp_path = temp_path(idx);
    let mut temp_file = File::create(&temp_path)?;
    temp_file.write_all(&bytes)?;
    temp_file.sync_all()?;
    fs::rename(&temp_path, idx)?;
    Ok(())
  }

  /// Whether this index describes the current contents of `log`.
  pub fn valid_for(&self, log: impl AsRef<Path>) -> Result<bool> {
    Ok(LogSignature::of(log.as_ref())? == self.signature)
  }

  /// Whether `idx` exists, decodes and describes the current `log`.
  pub fn valid_file(log: impl AsRef<Path>, idx: impl AsRef<Path>) -> bool {
    match Self::read(idx) {
      Ok(index) => index.valid_for(log).unwrap_or(false),
      Err(_) => false,
    }
  }

  pub fn signature(&self) -> LogSignature {
    self.signature
  }

  /// Offset of a trailing partial chunk left out of the index.
  pub fn truncated_at(&self) -> Option<u64> {
    self.truncated_at
  }

  /// Start of the first cycle and end of the last one.
  pub fn range(&self) -> Option<(Timestamp, Timestamp)> {
    let first = self.entries.first()?;
    let last = self.entries.last()?;
    Some((first.start, last.end_time()))
  }

  pub fn cycle_count(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, IndexEntry> {
    self.entries.iter()
  }

  pub fn get(&self, idx: usize) -> Option<&IndexEntry> {
    self.entries.get(idx)
  }

  pub fn entries(&self) -> &[IndexEntry] {
    &self.entries
  }

  /// Last cycle starting at or before `time`.
  pub fn cycle_at(&self, time: Timestamp) -> Option<&IndexEntry> {
    let after = self.entries.partition_point(|entry| entry.start <= time);
    after.checked_sub(1).and_then(|idx| self.entries.get(idx))
  }
}

impl<'a> IntoIterator for &'a Index {
  type Item = &'a IndexEntry;
  type IntoIter = std::slice::Iter<'a, IndexEntry>;

  fn into_iter(self) -> Self::IntoIter {
    self.entries.iter()
  }
}

fn entry_for(pos: u64, ordinal: u64, records: &[LogRecord]) -> IndexEntry {
  let record_count = records.len() as u64;
  let info = records
    .iter()
    .rev()
    .find(|record| record.name == CYCLE_END)
    .and_then(|record| record.args.first());

  if let Some(info) = info {
    if let Some(start) = info.get(CYCLE_INFO_START).and_then(|start| start.as_time()) {
      let end = info
        .get(CYCLE_INFO_END)
        .and_then(|end| end.as_int())
        .and_then(|end| u64::try_from(end).ok());
      let cycle_index = info
        .get(CYCLE_INFO_INDEX)
        .and_then(|idx| idx.as_int())
        .and_then(|idx| u64::try_from(idx).ok())
        .unwrap_or(ordinal);
      return IndexEntry {
        pos,
        cycle_index,
        start,
        end,
        record_count,
      };
    }
  }

  IndexEntry {
    pos,
    cycle_index: ordinal,
    start: records.first().map(|record| record.time).unwrap_or_default(),
    end: None,
    record_count,
  }
}

fn temp_path(path: &Path) -> PathBuf {
  let mut temp = path.as_os_str().to_owned();
  temp.push(".tmp");
  PathBuf::from(temp)
}
