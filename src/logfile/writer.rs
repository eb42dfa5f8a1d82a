//! Log file writer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::constants::FORMAT_VERSION;
use crate::distributed::Marshalled;
use crate::error::{PlanLogError, Result};

use super::format::write_header;
use super::record::{encode_cycle, LogRecord};

/// Options for [`Writer::open`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
  plugins: Vec<String>,
  version: u32,
  lock: bool,
  sync_on_flush: bool,
}

impl Default for WriterOptions {
  fn default() -> Self {
    Self {
      plugins: Vec::new(),
      version: FORMAT_VERSION,
      lock: true,
      sync_on_flush: false,
    }
  }
}

impl WriterOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Plugins a reader must activate before decoding the file.
  pub fn plugins(mut self, plugins: impl IntoIterator<Item = impl Into<String>>) -> Self {
    self.plugins = plugins.into_iter().map(Into::into).collect();
    self
  }

  pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
    self.plugins.push(plugin.into());
    self
  }

  /// Format version written in the header.
  pub fn version(mut self, version: u32) -> Self {
    self.version = version;
    self
  }

  /// Take an exclusive advisory lock on the file (default: true).
  pub fn lock(mut self, lock: bool) -> Self {
    self.lock = lock;
    self
  }

  /// Sync file data to disk on every [`Writer::flush`].
  pub fn sync_on_flush(mut self, sync: bool) -> Self {
    self.sync_on_flush = sync;
    self
  }
}

/// Single writer of a log file.
pub struct Writer {
  path: PathBuf,
  out: BufWriter<File>,
  position: u64,
  sync_on_flush: bool,
}

impl Writer {
  /// Create or truncate `path` and write the header.
  pub fn open(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .read(true)
      .write(true)
      .open(&path)?;
    if options.lock {
      lock_exclusive(&file, &path)?;
    }
    file.set_len(0)?;

    let mut out = BufWriter::new(file);
    out.rewind()?;
    write_header(&mut out, options.version, &options.plugins)?;
    let position = out.stream_position()?;

    tracing::debug!(
      path = %path.display(),
      version = options.version,
      plugins = ?options.plugins,
      "opened log file for writing"
    );
    Ok(Self {
      path,
      out,
      position,
      sync_on_flush: options.sync_on_flush,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Byte offset where the next chunk will start.
  pub fn tell(&self) -> u64 {
    self.position
  }

  /// Write one cycle as a chunk and return the offset it starts at.
  pub fn dump(&mut self, cycle: &[LogRecord]) -> Result<u64> {
    let payload = match encode_cycle(cycle) {
      Ok(payload) => payload,
      Err(PlanLogError::Unmarshallable(reason)) => {
        let culprit = find_invalid_marshalling_object(cycle);
        let location = culprit
          .as_ref()
          .map(|invalid| format!("{} ({})", invalid.path, invalid.type_name))
          .unwrap_or_else(|| "<unknown>".to_string());
        tracing::error!(
          fatal = true,
          path = %self.path.display(),
          culprit = %location,
          "cannot write cycle to log: {reason}"
        );
        return Err(PlanLogError::Unmarshallable(format!("{reason} at {location}")));
      }
      Err(err) => return Err(err),
    };

    let len = u32::try_from(payload.len()).map_err(|_| {
      PlanLogError::Serialization(format!("cycle too large for one chunk: {} bytes", payload.len()))
    })?;
    let start = self.position;
    self.out.write_u32::<LittleEndian>(len)?;
    self.out.write_all(&payload)?;
    self.position += 4 + payload.len() as u64;
    Ok(start)
  }

  pub fn flush(&mut self) -> Result<()> {
    self.out.flush()?;
    if self.sync_on_flush {
      self.out.get_ref().sync_data()?;
    }
    Ok(())
  }

  /// Flush and release the file.
  pub fn close(mut self) -> Result<()> {
    self.flush()?;
    self.out.get_ref().sync_all()?;
    Ok(())
  }
}

impl std::fmt::Debug for Writer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Writer")
      .field("path", &self.path)
      .field("position", &self.position)
      .finish()
  }
}

#[cfg(not(target_arch = "wasm32"))]
fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
  use fs2::FileExt;

  match file.try_lock_exclusive() {
    Ok(()) => Ok(()),
    Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
      Err(PlanLogError::WriterLocked(path.to_path_buf()))
    }
    Err(err) => Err(err.into()),
  }
}

#[cfg(target_arch = "wasm32")]
fn lock_exclusive(_file: &File, _path: &Path) -> Result<()> {
  Ok(())
}

/// Location of a value that cannot be written to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMarshalling {
  /// Path from the cycle to the value, e.g. `[2].args[1]/@arguments["goal"]`
  pub path: String,
  pub type_name: String,
}

/// Find the first value of `cycle` that has no log representation.
///
/// Object fields are searched before container elements.
pub fn find_invalid_marshalling_object(cycle: &[LogRecord]) -> Option<InvalidMarshalling> {
  cycle.iter().enumerate().find_map(|(record_idx, record)| {
    record.args.iter().enumerate().find_map(|(arg_idx, arg)| {
      find_in_value(arg, format!("[{record_idx}].{}.args[{arg_idx}]", record.name))
    })
  })
}

fn find_in_value(value: &Marshalled, path: String) -> Option<InvalidMarshalling> {
  if let Marshalled::Opaque(type_name) = value {
    return Some(InvalidMarshalling {
      path,
      type_name: type_name.clone(),
    });
  }
  value.children().into_iter().find_map(|(segment, child)| {
    let child_path = if segment.starts_with('@') {
      format!("{path}/{segment}")
    } else {
      format!("{path}{segment}")
    };
    find_in_value(child, child_path)
  })
}
