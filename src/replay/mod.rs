//! Plan logging and replay.
//!
//! [`EventLogger`] observes a running plan and writes one chunk per cycle.
//! [`PlanRebuilder`] reads those cycles back and maintains a mirror plan.

pub mod event_logger;
pub mod rebuilder;
pub mod records;

pub use event_logger::{EventLogger, EventLoggerOptions};
pub use rebuilder::{CycleReport, PlanRebuilder, PropagationRecord, RebuilderOptions, RecordFailure};
