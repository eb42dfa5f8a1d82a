//! planlog: record the evolution of an executing plan into cycle log files
//! and rebuild it on the other side.
//!
//! - [`distributed`]: identity registry and marshalling of plan values
//! - [`logfile`]: header, chunk framing, reader, writer and index sidecar
//! - [`replay`]: producer-side event logger and consumer-side plan rebuilder
//! - [`plan`]: tasks, events, models and relations being recorded

pub mod constants;
pub mod distributed;
pub mod error;
pub mod logfile;
pub mod plan;
pub mod replay;
pub mod types;

pub use error::{PlanLogError, Result};
pub use types::{ObjectId, PeerId, RemoteRef, Siblings, Timestamp};
