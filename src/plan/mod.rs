//! Plan data model observed by the event logger and rebuilt by the replay
//! engine.

pub mod event;
pub mod model;
pub mod object;
pub mod observer;
pub mod relations;
pub mod structure;
pub mod task;
pub mod value;

pub use event::{Emission, EventCall, EventGenerator};
pub use model::{Model, ModelKind, ModelNamespace};
pub use object::PlanObject;
pub use observer::{EdgeChange, PlanMerge, PlanObserver, PropagationKind};
pub use relations::{RelationGraph, RelationKind};
pub use structure::{Plan, PlanFlags, SharedObserver, Transaction};
pub use task::{Task, TASK_EVENTS};
pub use value::{DelayedArgument, ExceptionValue, Opaque, Value};
