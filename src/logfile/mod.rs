//! Log files: a header followed by one length-prefixed chunk per cycle, with
//! an optional index sidecar.

pub mod format;
pub mod index;
pub mod reader;
pub mod record;
pub mod writer;

pub use format::{guess_version, read_prologue, write_header, Prologue};
pub use index::{Index, IndexEntry, LogSignature};
pub use reader::{index_path, Cycles, NoPlugins, PluginLoader, PluginSet, Reader};
pub use record::{decode_cycle, encode_cycle, LogRecord};
pub use writer::{find_invalid_marshalling_object, InvalidMarshalling, Writer, WriterOptions};
