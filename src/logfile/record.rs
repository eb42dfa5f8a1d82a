//! Records and the encoding of one cycle into a chunk payload.

use std::io::Cursor;

use crate::distributed::wire::{
  decode_len, decode_str, decode_time, decode_value, encode_len, encode_str, encode_time,
  encode_value,
};
use crate::distributed::Marshalled;
use crate::error::{PlanLogError, Result};
use crate::types::Timestamp;

/// One logged call: a method name, when it happened and its marshalled
/// arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
  pub name: String,
  pub time: Timestamp,
  pub args: Vec<Marshalled>,
}

impl LogRecord {
  pub fn new(name: impl Into<String>, time: Timestamp, args: Vec<Marshalled>) -> Self {
    Self {
      name: name.into(),
      time,
      args,
    }
  }

  pub fn arg(&self, idx: usize) -> Result<&Marshalled> {
    self.args.get(idx).ok_or_else(|| {
      PlanLogError::InvalidRecord(format!(
        "{} expects at least {} arguments, got {}",
        self.name,
        idx + 1,
        self.args.len()
      ))
    })
  }
}

/// Encode the records of one cycle.
pub fn encode_cycle(records: &[LogRecord]) -> Result<Vec<u8>> {
  let mut out = Vec::new();
  encode_len(records.len(), &mut out)?;
  for record in records {
    encode_str(&record.name, &mut out)?;
    encode_time(record.time, &mut out)?;
    encode_len(record.args.len(), &mut out)?;
    for arg in &record.args {
      encode_value(arg, &mut out)?;
    }
  }
  Ok(out)
}

/// Decode a chunk payload. The payload must be consumed exactly.
pub fn decode_cycle(payload: &[u8]) -> Result<Vec<LogRecord>> {
  let mut cursor = Cursor::new(payload);
  let count = decode_len(&mut cursor)?;
  let mut records = Vec::with_capacity(count);
  for _ in 0..count {
    let name = decode_str(&mut cursor)?;
    let time = decode_time(&mut cursor)?;
    let argc = decode_len(&mut cursor)?;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
      args.push(decode_value(&mut cursor)?);
    }
    records.push(LogRecord { name, time, args });
  }

  if cursor.position() as usize != payload.len() {
    return Err(PlanLogError::Serialization(
      "cycle payload contains unexpected trailing bytes".to_string(),
    ));
  }
  Ok(records)
}
