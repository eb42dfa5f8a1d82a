//! Constants shared by the log format, index and replay layers

/// Leading bytes of every log file
pub const MAGIC_CODE: &[u8; 8] = b"ROBYLOG\0";

/// Version written by [`crate::logfile::Writer`] and required by
/// [`crate::logfile::Reader`]
pub const FORMAT_VERSION: u32 = 5;

/// Size of the little-endian length prefix of each chunk
pub const CHUNK_LENGTH_BYTES: usize = 4;

/// Extension of the index sidecar
pub const EXT_INDEX: &str = "idx";

/// Version of the index sidecar envelope
pub const INDEX_ENVELOPE_VERSION: u32 = 1;

/// Name of the record closing a cycle
pub const CYCLE_END: &str = "cycle_end";

/// Keys of the `cycle_end` info map
pub const CYCLE_INFO_START: &str = "start";
pub const CYCLE_INFO_END: &str = "end";
pub const CYCLE_INFO_INDEX: &str = "cycle_index";
