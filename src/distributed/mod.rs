//! Object identity across peers and the marshalling of plan values.

pub mod dumped;
pub mod marshal;
pub mod object_manager;
pub mod wire;

pub use dumped::{
  DRobyDump, DRobyLoad, Dumped, DumpedDelayed, DumpedEvent, DumpedException, DumpedModel,
  DumpedTask, DumpedTaskEvent, Marshalled,
};
pub use marshal::Marshaller;
pub use object_manager::{Identifiable, ObjectManager};
