//! Binary encoding of [`Marshalled`] values.
//!
//! All integers are little-endian. Every value starts with a one-byte tag;
//! strings and collections are prefixed with a `u32` length.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{PlanLogError, Result};
use crate::plan::ModelKind;
use crate::types::{ObjectId, PeerId, RemoteRef, Siblings, Timestamp};

use super::{
  Dumped, DumpedDelayed, DumpedEvent, DumpedException, DumpedModel, DumpedTask, DumpedTaskEvent,
  Marshalled,
};

const TAG_NIL: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_SYMBOL: u8 = 6;
const TAG_TIME: u8 = 7;
const TAG_LIST: u8 = 8;
const TAG_MAP: u8 = 9;
const TAG_REF: u8 = 10;
const TAG_ID: u8 = 11;
const TAG_OBJECT: u8 = 12;

const KIND_MODEL: u8 = 0;
const KIND_TASK: u8 = 1;
const KIND_EVENT: u8 = 2;
const KIND_TASK_EVENT: u8 = 3;
const KIND_EXCEPTION: u8 = 4;
const KIND_DELAYED: u8 = 5;

/// Nesting limit enforced while decoding.
const MAX_DEPTH: usize = 128;

// ============================================================================
// Encoding
// ============================================================================

/// Append the encoding of `value` to `out`.
///
/// Fails with [`PlanLogError::Unmarshallable`] when `value` contains an
/// opaque value.
pub fn encode_value(value: &Marshalled, out: &mut Vec<u8>) -> Result<()> {
  match value {
    Marshalled::Nil => out.push(TAG_NIL),
    Marshalled::Bool(true) => out.push(TAG_TRUE),
    Marshalled::Bool(false) => out.push(TAG_FALSE),
    Marshalled::Int(value) => {
      out.push(TAG_INT);
      out.write_i64::<LittleEndian>(*value)?;
    }
    Marshalled::Float(value) => {
      out.push(TAG_FLOAT);
      out.write_f64::<LittleEndian>(*value)?;
    }
    Marshalled::Str(value) => {
      out.push(TAG_STR);
      encode_str(value, out)?;
    }
    Marshalled::Symbol(value) => {
      out.push(TAG_SYMBOL);
      encode_str(value, out)?;
    }
    Marshalled::Time(time) => {
      out.push(TAG_TIME);
      encode_time(*time, out)?;
    }
    Marshalled::List(values) => {
      out.push(TAG_LIST);
      encode_len(values.len(), out)?;
      for value in values {
        encode_value(value, out)?;
      }
    }
    Marshalled::Map(entries) => {
      out.push(TAG_MAP);
      encode_len(entries.len(), out)?;
      for (key, value) in entries {
        encode_value(key, out)?;
        encode_value(value, out)?;
      }
    }
    Marshalled::Ref(remote) => {
      out.push(TAG_REF);
      encode_str(remote.peer.as_str(), out)?;
      out.write_u64::<LittleEndian>(remote.id.as_u64())?;
    }
    Marshalled::Id(id) => {
      out.push(TAG_ID);
      out.write_u64::<LittleEndian>(id.as_u64())?;
    }
    Marshalled::Object(dumped) => {
      out.push(TAG_OBJECT);
      encode_dumped(dumped, out)?;
    }
    Marshalled::Opaque(type_name) => {
      return Err(PlanLogError::Unmarshallable(format!(
        "values of type {type_name} cannot be written to the log"
      )));
    }
  }
  Ok(())
}

fn encode_dumped(dumped: &Dumped, out: &mut Vec<u8>) -> Result<()> {
  match dumped {
    Dumped::Model(model) => {
      out.push(KIND_MODEL);
      encode_siblings(&model.remote_siblings, out)?;
      encode_opt_str(model.name.as_deref(), out)?;
      out.push(model.kind.as_u8());
      match &model.supermodel {
        Some(supermodel) => {
          out.push(1);
          encode_value(supermodel, out)?;
        }
        None => out.push(0),
      }
    }
    Dumped::Task(task) => {
      out.push(KIND_TASK);
      encode_siblings(&task.remote_siblings, out)?;
      encode_value(&task.model, out)?;
      encode_len(task.arguments.len(), out)?;
      for (key, value) in &task.arguments {
        encode_str(key, out)?;
        encode_value(value, out)?;
      }
      encode_opt_time(task.addition_time, out)?;
    }
    Dumped::Event(event) => {
      out.push(KIND_EVENT);
      encode_siblings(&event.remote_siblings, out)?;
      encode_value(&event.model, out)?;
      out.push(u8::from(event.controlable));
      encode_opt_time(event.addition_time, out)?;
    }
    Dumped::TaskEvent(event) => {
      out.push(KIND_TASK_EVENT);
      encode_value(&event.task, out)?;
      encode_str(&event.symbol, out)?;
    }
    Dumped::Exception(exception) => {
      out.push(KIND_EXCEPTION);
      encode_str(&exception.class_name, out)?;
      encode_str(&exception.message, out)?;
      encode_len(exception.original_exceptions.len(), out)?;
      for original in &exception.original_exceptions {
        encode_value(original, out)?;
      }
    }
    Dumped::Delayed(delayed) => {
      out.push(KIND_DELAYED);
      encode_str(&delayed.description, out)?;
    }
  }
  Ok(())
}

pub(crate) fn encode_len(len: usize, out: &mut Vec<u8>) -> Result<()> {
  let len = u32::try_from(len)
    .map_err(|_| PlanLogError::Serialization(format!("collection too large: {len}")))?;
  out.write_u32::<LittleEndian>(len)?;
  Ok(())
}

pub(crate) fn encode_str(value: &str, out: &mut Vec<u8>) -> Result<()> {
  encode_len(value.len(), out)?;
  out.extend_from_slice(value.as_bytes());
  Ok(())
}

fn encode_opt_str(value: Option<&str>, out: &mut Vec<u8>) -> Result<()> {
  match value {
    Some(value) => {
      out.push(1);
      encode_str(value, out)
    }
    None => {
      out.push(0);
      Ok(())
    }
  }
}

pub(crate) fn encode_time(time: Timestamp, out: &mut Vec<u8>) -> Result<()> {
  out.write_i64::<LittleEndian>(time.sec)?;
  out.write_u32::<LittleEndian>(time.usec)?;
  Ok(())
}

fn encode_opt_time(time: Option<Timestamp>, out: &mut Vec<u8>) -> Result<()> {
  match time {
    Some(time) => {
      out.push(1);
      encode_time(time, out)
    }
    None => {
      out.push(0);
      Ok(())
    }
  }
}

fn encode_siblings(siblings: &Siblings, out: &mut Vec<u8>) -> Result<()> {
  encode_len(siblings.len(), out)?;
  for (peer, id) in siblings {
    encode_str(peer.as_str(), out)?;
    out.write_u64::<LittleEndian>(id.as_u64())?;
  }
  Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one value from `cursor`.
pub fn decode_value(cursor: &mut Cursor<&[u8]>) -> Result<Marshalled> {
  decode_at_depth(cursor, 0)
}

fn decode_at_depth(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Marshalled> {
  if depth > MAX_DEPTH {
    return Err(PlanLogError::Serialization(
      "marshalled value nested too deeply".to_string(),
    ));
  }

  let tag = read_u8(cursor)?;
  let value = match tag {
    TAG_NIL => Marshalled::Nil,
    TAG_TRUE => Marshalled::Bool(true),
    TAG_FALSE => Marshalled::Bool(false),
    TAG_INT => Marshalled::Int(cursor.read_i64::<LittleEndian>().map_err(short_read)?),
    TAG_FLOAT => Marshalled::Float(cursor.read_f64::<LittleEndian>().map_err(short_read)?),
    TAG_STR => Marshalled::Str(decode_str(cursor)?),
    TAG_SYMBOL => Marshalled::Symbol(decode_str(cursor)?),
    TAG_TIME => Marshalled::Time(decode_time(cursor)?),
    TAG_LIST => {
      let len = decode_len(cursor)?;
      let mut values = Vec::with_capacity(len);
      for _ in 0..len {
        values.push(decode_at_depth(cursor, depth + 1)?);
      }
      Marshalled::List(values)
    }
    TAG_MAP => {
      let len = decode_len(cursor)?;
      let mut entries = Vec::with_capacity(len);
      for _ in 0..len {
        let key = decode_at_depth(cursor, depth + 1)?;
        let value = decode_at_depth(cursor, depth + 1)?;
        entries.push((key, value));
      }
      Marshalled::Map(entries)
    }
    TAG_REF => {
      let peer = PeerId::new(decode_str(cursor)?);
      let id = decode_id(cursor)?;
      Marshalled::Ref(RemoteRef::new(peer, id))
    }
    TAG_ID => Marshalled::Id(decode_id(cursor)?),
    TAG_OBJECT => Marshalled::Object(Box::new(decode_dumped(cursor, depth + 1)?)),
    other => {
      return Err(PlanLogError::Serialization(format!(
        "unknown value tag {other}"
      )))
    }
  };
  Ok(value)
}

fn decode_dumped(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Dumped> {
  let kind = read_u8(cursor)?;
  let dumped = match kind {
    KIND_MODEL => {
      let remote_siblings = decode_siblings(cursor)?;
      let name = decode_opt_str(cursor)?;
      let raw_kind = read_u8(cursor)?;
      let kind = ModelKind::from_u8(raw_kind).ok_or_else(|| {
        PlanLogError::Serialization(format!("unknown model kind {raw_kind}"))
      })?;
      let supermodel = match read_flag(cursor)? {
        true => Some(decode_at_depth(cursor, depth + 1)?),
        false => None,
      };
      Dumped::Model(DumpedModel {
        remote_siblings,
        name,
        kind,
        supermodel,
      })
    }
    KIND_TASK => {
      let remote_siblings = decode_siblings(cursor)?;
      let model = decode_at_depth(cursor, depth + 1)?;
      let len = decode_len(cursor)?;
      let mut arguments = Vec::with_capacity(len);
      for _ in 0..len {
        let key = decode_str(cursor)?;
        let value = decode_at_depth(cursor, depth + 1)?;
        arguments.push((key, value));
      }
      let addition_time = decode_opt_time(cursor)?;
      Dumped::Task(DumpedTask {
        remote_siblings,
        model,
        arguments,
        addition_time,
      })
    }
    KIND_EVENT => {
      let remote_siblings = decode_siblings(cursor)?;
      let model = decode_at_depth(cursor, depth + 1)?;
      let controlable = read_flag(cursor)?;
      let addition_time = decode_opt_time(cursor)?;
      Dumped::Event(DumpedEvent {
        remote_siblings,
        model,
        controlable,
        addition_time,
      })
    }
    KIND_TASK_EVENT => {
      let task = decode_at_depth(cursor, depth + 1)?;
      let symbol = decode_str(cursor)?;
      Dumped::TaskEvent(DumpedTaskEvent { task, symbol })
    }
    KIND_EXCEPTION => {
      let class_name = decode_str(cursor)?;
      let message = decode_str(cursor)?;
      let len = decode_len(cursor)?;
      let mut original_exceptions = Vec::with_capacity(len);
      for _ in 0..len {
        original_exceptions.push(decode_at_depth(cursor, depth + 1)?);
      }
      Dumped::Exception(DumpedException {
        class_name,
        message,
        original_exceptions,
      })
    }
    KIND_DELAYED => Dumped::Delayed(DumpedDelayed {
      description: decode_str(cursor)?,
    }),
    other => {
      return Err(PlanLogError::Serialization(format!(
        "unknown object kind {other}"
      )))
    }
  };
  Ok(dumped)
}

fn short_read(_: std::io::Error) -> PlanLogError {
  PlanLogError::Serialization("marshalled value truncated".to_string())
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
  let len = cursor.get_ref().len() as u64;
  len.saturating_sub(cursor.position()) as usize
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
  cursor.read_u8().map_err(short_read)
}

fn read_flag(cursor: &mut Cursor<&[u8]>) -> Result<bool> {
  match read_u8(cursor)? {
    0 => Ok(false),
    1 => Ok(true),
    other => Err(PlanLogError::Serialization(format!(
      "invalid flag byte {other}"
    ))),
  }
}

/// Read a collection length. Every element takes at least one byte, so a
/// length larger than the remaining input is corrupt.
pub(crate) fn decode_len(cursor: &mut Cursor<&[u8]>) -> Result<usize> {
  let len = cursor.read_u32::<LittleEndian>().map_err(short_read)? as usize;
  if len > remaining(cursor) {
    return Err(PlanLogError::Serialization(format!(
      "length {len} exceeds the {} remaining bytes",
      remaining(cursor)
    )));
  }
  Ok(len)
}

pub(crate) fn decode_str(cursor: &mut Cursor<&[u8]>) -> Result<String> {
  let len = decode_len(cursor)?;
  let mut bytes = vec![0u8; len];
  cursor.read_exact(&mut bytes).map_err(short_read)?;
  String::from_utf8(bytes)
    .map_err(|err| PlanLogError::Serialization(format!("invalid UTF-8 string: {err}")))
}

fn decode_opt_str(cursor: &mut Cursor<&[u8]>) -> Result<Option<String>> {
  match read_flag(cursor)? {
    true => decode_str(cursor).map(Some),
    false => Ok(None),
  }
}

pub(crate) fn decode_time(cursor: &mut Cursor<&[u8]>) -> Result<Timestamp> {
  let sec = cursor.read_i64::<LittleEndian>().map_err(short_read)?;
  let usec = cursor.read_u32::<LittleEndian>().map_err(short_read)?;
  if usec >= 1_000_000 {
    return Err(PlanLogError::Serialization(format!(
      "invalid microsecond field {usec}"
    )));
  }
  Ok(Timestamp::new(sec, usec))
}

fn decode_opt_time(cursor: &mut Cursor<&[u8]>) -> Result<Option<Timestamp>> {
  match read_flag(cursor)? {
    true => decode_time(cursor).map(Some),
    false => Ok(None),
  }
}

fn decode_id(cursor: &mut Cursor<&[u8]>) -> Result<ObjectId> {
  cursor
    .read_u64::<LittleEndian>()
    .map(ObjectId::from_raw)
    .map_err(short_read)
}

fn decode_siblings(cursor: &mut Cursor<&[u8]>) -> Result<Siblings> {
  let len = decode_len(cursor)?;
  let mut siblings = Siblings::new();
  for _ in 0..len {
    let peer = PeerId::new(decode_str(cursor)?);
    let id = decode_id(cursor)?;
    siblings.insert(peer, id);
  }
  Ok(siblings)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn roundtrip(value: &Marshalled) -> Marshalled {
    let mut bytes = Vec::new();
    encode_value(value, &mut bytes).expect("encode");
    let mut cursor = Cursor::new(bytes.as_slice());
    let decoded = decode_value(&mut cursor).expect("decode");
    assert_eq!(cursor.position() as usize, bytes.len());
    decoded
  }

  #[test]
  fn test_nested_payload_roundtrip() {
    let mut siblings = Siblings::new();
    siblings.insert(PeerId::new("robot"), ObjectId::from_raw(12));
    let task = Marshalled::Object(Box::new(Dumped::Task(DumpedTask {
      remote_siblings: siblings,
      model: Marshalled::Ref(RemoteRef::new(PeerId::new("robot"), ObjectId::from_raw(3))),
      arguments: vec![
        ("goal".to_string(), Marshalled::List(vec![Marshalled::Float(1.5), Marshalled::Nil])),
        ("speed".to_string(), Marshalled::Int(-4)),
      ],
      addition_time: Some(Timestamp::new(1_700_000_000, 250)),
    })));
    assert_eq!(roundtrip(&task), task);
  }

  #[test]
  fn test_opaque_values_are_rejected() {
    let value = Marshalled::List(vec![Marshalled::Int(1), Marshalled::Opaque("Socket".to_string())]);
    let err = encode_value(&value, &mut Vec::new()).expect_err("opaque");
    assert!(matches!(err, PlanLogError::Unmarshallable(_)));
  }

  #[test]
  fn test_oversized_length_is_rejected() {
    let mut bytes = vec![TAG_LIST];
    bytes.extend_from_slice(&u32::MAX.to_le_bytes());
    let err = decode_value(&mut Cursor::new(bytes.as_slice())).expect_err("corrupt length");
    assert!(matches!(err, PlanLogError::Serialization(_)));
  }

  #[test]
  fn test_excessive_nesting_is_rejected() {
    let mut bytes = Vec::new();
    for _ in 0..(MAX_DEPTH + 8) {
      bytes.push(TAG_LIST);
      bytes.extend_from_slice(&1u32.to_le_bytes());
    }
    bytes.push(TAG_NIL);
    assert!(decode_value(&mut Cursor::new(bytes.as_slice())).is_err());
  }
}
