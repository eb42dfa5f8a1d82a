//! Identity and time types shared by every layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique handle of a local object.
///
/// Allocated from a strictly increasing counter and never reused. The same
/// type names objects of other processes: an id received from a peer is that
/// peer's `ObjectId` for the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
  pub fn allocate() -> Self {
    Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::SeqCst))
  }

  /// Wrap an id received from the wire.
  pub const fn from_raw(raw: u64) -> Self {
    Self(raw)
  }

  pub const fn as_u64(self) -> u64 {
    self.0
  }
}

impl fmt::Display for ObjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x{:x}", self.0)
  }
}

/// Name of a peer (a process, or a log session) objects can be known to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for PeerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for PeerId {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

/// An object as known by a specific peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteRef {
  pub peer: PeerId,
  pub id: ObjectId,
}

impl RemoteRef {
  pub fn new(peer: PeerId, id: ObjectId) -> Self {
    Self { peer, id }
  }
}

impl fmt::Display for RemoteRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.id, self.peer)
  }
}

/// Per-peer identifiers of one object.
pub type Siblings = BTreeMap<PeerId, ObjectId>;

/// Wall-clock instant with microsecond precision.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Timestamp {
  pub sec: i64,
  pub usec: u32,
}

impl Timestamp {
  pub const fn new(sec: i64, usec: u32) -> Self {
    Self { sec, usec }
  }

  pub fn now() -> Self {
    Self::from_system_time(SystemTime::now())
  }

  pub fn from_system_time(time: SystemTime) -> Self {
    match time.duration_since(UNIX_EPOCH) {
      Ok(elapsed) => Self {
        sec: elapsed.as_secs() as i64,
        usec: elapsed.subsec_micros(),
      },
      Err(before) => {
        let before = before.duration();
        let mut sec = -(before.as_secs() as i64);
        let mut usec = 0;
        if before.subsec_micros() > 0 {
          sec -= 1;
          usec = 1_000_000 - before.subsec_micros();
        }
        Self { sec, usec }
      }
    }
  }

  pub fn as_micros(self) -> i128 {
    self.sec as i128 * 1_000_000 + self.usec as i128
  }

  pub fn from_micros(micros: i128) -> Self {
    let sec = micros.div_euclid(1_000_000) as i64;
    let usec = micros.rem_euclid(1_000_000) as u32;
    Self { sec, usec }
  }

  /// Instant `offset` after this one.
  pub fn add_micros(self, offset: u64) -> Self {
    Self::from_micros(self.as_micros() + offset as i128)
  }

  /// Microseconds from `earlier` to `self`, saturating at zero.
  pub fn micros_since(self, earlier: Timestamp) -> u64 {
    let delta = self.as_micros() - earlier.as_micros();
    if delta <= 0 {
      0
    } else {
      u64::try_from(delta).unwrap_or(u64::MAX)
    }
  }

  pub fn as_duration_since_epoch(self) -> Option<Duration> {
    if self.sec < 0 {
      return None;
    }
    Some(Duration::new(self.sec as u64, self.usec * 1_000))
  }
}

impl fmt::Display for Timestamp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{:06}", self.sec, self.usec)
  }
}

#[cfg(test)]
mod tests {
  use super::{ObjectId, Timestamp};

  #[test]
  fn object_ids_are_strictly_increasing() {
    let first = ObjectId::allocate();
    let second = ObjectId::allocate();
    assert!(second > first);
    assert_ne!(first, second);
  }

  #[test]
  fn timestamp_micros_roundtrip_handles_negative_instants() {
    let time = Timestamp::new(-3, 250_000);
    assert_eq!(Timestamp::from_micros(time.as_micros()), time);
    assert_eq!(time.add_micros(750_000), Timestamp::new(-2, 0));
  }

  #[test]
  fn micros_since_saturates() {
    let early = Timestamp::new(10, 5);
    let late = Timestamp::new(11, 4);
    assert_eq!(late.micros_since(early), 999_999);
    assert_eq!(early.micros_since(late), 0);
  }
}
