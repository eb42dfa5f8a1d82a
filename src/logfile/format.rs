//! File header: magic code, format version and plugin list.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::constants::MAGIC_CODE;
use crate::error::{PlanLogError, Result};

/// Everything stored before the first chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prologue {
  pub version: u32,
  pub plugins: Vec<String>,
}

pub fn write_header<W: Write>(stream: &mut W, version: u32, plugins: &[String]) -> Result<()> {
  stream.write_all(MAGIC_CODE)?;
  stream.write_u32::<LittleEndian>(version)?;

  let count = u32::try_from(plugins.len())
    .map_err(|_| PlanLogError::Serialization(format!("too many plugins: {}", plugins.len())))?;
  stream.write_u32::<LittleEndian>(count)?;
  for plugin in plugins {
    let len = u32::try_from(plugin.len())
      .map_err(|_| PlanLogError::Serialization(format!("plugin name too long: {plugin}")))?;
    stream.write_u32::<LittleEndian>(len)?;
    stream.write_all(plugin.as_bytes())?;
  }
  Ok(())
}

/// Format version of the stream, if it starts with a complete magic code and
/// version field. The stream position is left unchanged.
pub fn guess_version<S: Read + Seek>(stream: &mut S) -> Option<u32> {
  let start = stream.stream_position().ok()?;
  let version = read_magic_and_version(stream).ok();
  stream.seek(SeekFrom::Start(start)).ok()?;
  version
}

fn read_magic_and_version<R: Read>(stream: &mut R) -> Result<u32> {
  let mut magic = [0u8; MAGIC_CODE.len()];
  stream
    .read_exact(&mut magic)
    .map_err(|_| PlanLogError::InvalidFile("missing or partial magic code".to_string()))?;
  if &magic != MAGIC_CODE {
    return Err(PlanLogError::InvalidFile(
      "not a plan log file (bad magic code)".to_string(),
    ));
  }
  stream
    .read_u32::<LittleEndian>()
    .map_err(|_| PlanLogError::InvalidFile("truncated format version".to_string()))
}

/// Read the header and leave the stream at the first chunk.
pub fn read_prologue<R: Read>(stream: &mut R) -> Result<Prologue> {
  let version = read_magic_and_version(stream)?;

  let count = stream
    .read_u32::<LittleEndian>()
    .map_err(|_| PlanLogError::InvalidFile("truncated plugin list".to_string()))?;
  let mut plugins = Vec::new();
  for _ in 0..count {
    let len = stream
      .read_u32::<LittleEndian>()
      .map_err(|_| PlanLogError::InvalidFile("truncated plugin list".to_string()))?;
    let mut name = Vec::new();
    stream
      .by_ref()
      .take(u64::from(len))
      .read_to_end(&mut name)?;
    if name.len() != len as usize {
      return Err(PlanLogError::InvalidFile(
        "truncated plugin name".to_string(),
      ));
    }
    let name = String::from_utf8(name)
      .map_err(|err| PlanLogError::InvalidFile(format!("plugin name is not UTF-8: {err}")))?;
    plugins.push(name);
  }

  Ok(Prologue { version, plugins })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constants::FORMAT_VERSION;
  use std::io::Cursor;

  fn header(plugins: &[&str]) -> Vec<u8> {
    let plugins: Vec<String> = plugins.iter().map(|p| p.to_string()).collect();
    let mut bytes = Vec::new();
    write_header(&mut bytes, FORMAT_VERSION, &plugins).expect("write header");
    bytes
  }

  #[test]
  fn test_header_layout() {
    let bytes = header(&["vision"]);
    assert_eq!(&bytes[..8], b"ROBYLOG\0");
    assert_eq!(&bytes[8..12], &5u32.to_le_bytes());
    assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
    assert_eq!(&bytes[16..20], &6u32.to_le_bytes());
    assert_eq!(&bytes[20..], b"vision");
  }

  #[test]
  fn test_prologue_roundtrip() {
    let bytes = header(&["a", "bc"]);
    let prologue = read_prologue(&mut Cursor::new(bytes)).expect("prologue");
    assert_eq!(prologue.version, FORMAT_VERSION);
    assert_eq!(prologue.plugins, vec!["a".to_string(), "bc".to_string()]);
  }

  #[test]
  fn test_guess_version_restores_position() {
    let mut cursor = Cursor::new(header(&[]));
    assert_eq!(guess_version(&mut cursor), Some(FORMAT_VERSION));
    assert_eq!(cursor.position(), 0);

    let mut short = Cursor::new(b"ROBYLOG\0\x05".to_vec());
    assert_eq!(guess_version(&mut short), None);
    assert_eq!(short.position(), 0);

    let mut foreign = Cursor::new(b"NOTALOG\0\x05\0\0\0".to_vec());
    assert_eq!(guess_version(&mut foreign), None);
  }

  #[test]
  fn test_truncated_header_is_invalid() {
    let bytes = header(&["plugin"]);
    for len in [0, 4, 8, 10, 14, 18, bytes.len() - 1] {
      let err = read_prologue(&mut Cursor::new(&bytes[..len])).expect_err("truncated header");
      assert!(matches!(err, PlanLogError::InvalidFile(_)), "len {len}: {err}");
    }
  }
}
