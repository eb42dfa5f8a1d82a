//! Error types for planlog

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ObjectId, PeerId};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, PlanLogError>;

#[derive(Debug, Error)]
pub enum PlanLogError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// Missing or partial magic code, or a truncated header
  #[error("invalid log file: {0}")]
  InvalidFile(String),

  #[error("log file format version {found} is not supported (expected {expected})")]
  InvalidFormatVersion { found: u32, expected: u32 },

  /// A chunk length or payload is shorter than declared
  #[error("truncated log file: {0}")]
  TruncatedFile(String),

  #[error("index file missing: {}", .0.display())]
  IndexMissing(PathBuf),

  #[error("index file is stale: {}", .0.display())]
  IndexInvalid(PathBuf),

  #[error("no object known as {id} on peer {peer}")]
  UnknownSibling { peer: PeerId, id: ObjectId },

  #[error("cannot find a local object for {0}")]
  NoLocalObject(String),

  /// Sibling bookkeeping no longer matches the protocol stream
  #[error("object registry consistency error: {0}")]
  RegistryConsistency(String),

  /// A value that cannot be written to a log file
  #[error("cannot marshal: {0}")]
  Unmarshallable(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("plugin '{0}' cannot be activated")]
  UnknownPlugin(String),

  #[error("invalid log record: {0}")]
  InvalidRecord(String),

  #[error("log file is locked by another writer: {}", .0.display())]
  WriterLocked(PathBuf),

  #[error("version mismatch: required {required}, current {current}")]
  VersionMismatch { required: u32, current: u32 },

  #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
  CrcMismatch { stored: u32, computed: u32 },
}

impl PlanLogError {
  /// Structural file errors desynchronize chunk framing and end the read.
  pub fn is_structural(&self) -> bool {
    matches!(
      self,
      PlanLogError::InvalidFile(_)
        | PlanLogError::InvalidFormatVersion { .. }
        | PlanLogError::TruncatedFile(_)
    )
  }

  /// Identity errors are local to the record that raised them.
  pub fn is_identity(&self) -> bool {
    matches!(
      self,
      PlanLogError::UnknownSibling { .. } | PlanLogError::NoLocalObject(_)
    )
  }
}
