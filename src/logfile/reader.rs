//! Sequential and random access reading of log files.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::constants::{CHUNK_LENGTH_BYTES, EXT_INDEX, FORMAT_VERSION};
use crate::error::{PlanLogError, Result};

use super::format::{read_prologue, Prologue};
use super::index::Index;
use super::record::{decode_cycle, LogRecord};

/// Activates the plugins a log file declares in its header.
pub trait PluginLoader {
  /// Return false to refuse the plugin.
  fn activate(&self, name: &str) -> bool;
}

/// Refuses every plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlugins;

impl PluginLoader for NoPlugins {
  fn activate(&self, _name: &str) -> bool {
    false
  }
}

/// Accepts a fixed set of plugin names.
#[derive(Debug, Clone, Default)]
pub struct PluginSet {
  names: BTreeSet<String>,
}

impl PluginSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: impl Into<String>) -> Self {
    self.names.insert(name.into());
    self
  }
}

impl PluginLoader for PluginSet {
  fn activate(&self, name: &str) -> bool {
    self.names.contains(name)
  }
}

impl<F: Fn(&str) -> bool> PluginLoader for F {
  fn activate(&self, name: &str) -> bool {
    self(name)
  }
}

/// Reader over the chunks of one log file.
pub struct Reader {
  path: PathBuf,
  input: BufReader<File>,
  prologue: Prologue,
  data_start: u64,
}

impl Reader {
  /// Open a log file that declares no plugins.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with_plugins(path, &NoPlugins)
  }

  pub fn open_with_plugins(path: impl AsRef<Path>, loader: &dyn PluginLoader) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let mut input = BufReader::new(File::open(&path)?);
    let prologue = read_prologue(&mut input)?;
    if prologue.version != FORMAT_VERSION {
      return Err(PlanLogError::InvalidFormatVersion {
        found: prologue.version,
        expected: FORMAT_VERSION,
      });
    }

    for plugin in &prologue.plugins {
      if !loader.activate(plugin) {
        return Err(PlanLogError::UnknownPlugin(plugin.clone()));
      }
      tracing::debug!(path = %path.display(), plugin = %plugin, "activated log plugin");
    }

    let data_start = input.stream_position()?;
    Ok(Self {
      path,
      input,
      prologue,
      data_start,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn prologue(&self) -> &Prologue {
    &self.prologue
  }

  pub fn plugins(&self) -> &[String] {
    &self.prologue.plugins
  }

  /// Offset of the first chunk.
  pub fn data_start(&self) -> u64 {
    self.data_start
  }

  pub fn tell(&mut self) -> Result<u64> {
    Ok(self.input.stream_position()?)
  }

  pub fn seek(&mut self, position: u64) -> Result<()> {
    self.input.seek(SeekFrom::Start(position))?;
    Ok(())
  }

  /// Go back to the first chunk.
  pub fn rewind(&mut self) -> Result<()> {
    self.seek(self.data_start)
  }

  pub fn end_of_file(&mut self) -> Result<bool> {
    Ok(self.input.fill_buf()?.is_empty())
  }

  /// Read the cycle at the current position.
  ///
  /// Returns `Ok(None)` at a clean end of file. On a truncated chunk the
  /// position is left at the start of that chunk.
  pub fn load_one_cycle(&mut self) -> Result<Option<Vec<LogRecord>>> {
    let start = self.input.stream_position()?;
    match read_chunk(&mut self.input) {
      Ok(Some(payload)) => decode_cycle(&payload).map(Some),
      Ok(None) => Ok(None),
      Err(err) => {
        self.input.seek(SeekFrom::Start(start))?;
        Err(err)
      }
    }
  }

  /// Read the cycle whose chunk starts at `position`.
  pub fn read_cycle_at(&mut self, position: u64) -> Result<Vec<LogRecord>> {
    self.seek(position)?;
    self
      .load_one_cycle()?
      .ok_or_else(|| PlanLogError::TruncatedFile(format!("no cycle at offset {position}")))
  }

  /// Iterate over the remaining cycles.
  pub fn cycles(&mut self) -> Cycles<'_> {
    Cycles {
      reader: self,
      done: false,
    }
  }

  /// Path of the index sidecar: same directory and stem, `idx` extension.
  pub fn index_path(&self) -> PathBuf {
    index_path(&self.path)
  }

  /// Scan the whole file and write a fresh index. The reader's position is
  /// not changed.
  pub fn rebuild_index(&self) -> Result<Index> {
    let index = Index::rebuild(self)?;
    index.write(self.index_path())?;
    Ok(index)
  }

  /// Load the index sidecar, rebuilding it when missing or stale if
  /// `rebuild` is set.
  pub fn index(&self, rebuild: bool) -> Result<Index> {
    let idx = self.index_path();
    let problem = match Index::read(&idx) {
      Ok(index) if index.valid_for(&self.path)? => return Ok(index),
      Ok(_) => PlanLogError::IndexInvalid(idx),
      Err(PlanLogError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
        PlanLogError::IndexMissing(idx)
      }
      Err(err) => {
        tracing::debug!(path = %idx.display(), "cannot load index: {err}");
        PlanLogError::IndexInvalid(idx)
      }
    };

    if !rebuild {
      return Err(problem);
    }
    tracing::warn!("rebuilding index file for {}", self.path.display());
    self.rebuild_index()
  }
}

impl std::fmt::Debug for Reader {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Reader")
      .field("path", &self.path)
      .field("prologue", &self.prologue)
      .finish()
  }
}

/// Iterator returned by [`Reader::cycles`]. Stops after the first error.
pub struct Cycles<'a> {
  reader: &'a mut Reader,
  done: bool,
}

impl Iterator for Cycles<'_> {
  type Item = Result<Vec<LogRecord>>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    match self.reader.load_one_cycle() {
      Ok(Some(cycle)) => Some(Ok(cycle)),
      Ok(None) => {
        self.done = true;
        None
      }
      Err(err) => {
        self.done = true;
        Some(Err(err))
      }
    }
  }
}

pub fn index_path(log: &Path) -> PathBuf {
  log.with_extension(EXT_INDEX)
}

/// Read one chunk payload. `Ok(None)` at a clean end of input.
pub(crate) fn read_chunk<R: Read>(input: &mut R) -> Result<Option<Vec<u8>>> {
  let mut len_bytes = [0u8; CHUNK_LENGTH_BYTES];
  let got = read_up_to(input, &mut len_bytes)?;
  if got == 0 {
    return Ok(None);
  }
  if got < CHUNK_LENGTH_BYTES {
    return Err(PlanLogError::TruncatedFile(format!(
      "chunk length field has {got} of {CHUNK_LENGTH_BYTES} bytes"
    )));
  }

  let len = u32::from_le_bytes(len_bytes) as usize;
  let mut payload = Vec::new();
  input.take(len as u64).read_to_end(&mut payload)?;
  if payload.len() != len {
    return Err(PlanLogError::TruncatedFile(format!(
      "chunk payload has {} of {len} bytes",
      payload.len()
    )));
  }
  Ok(Some(payload))
}

fn read_up_to<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
  let mut filled = 0;
  while filled < buf.len() {
    match input.read(&mut buf[filled..]) {
      Ok(0) => break,
      Ok(n) => filled += n,
      Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
      Err(err) => return Err(err.into()),
    }
  }
  Ok(filled)
}
