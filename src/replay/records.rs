//! Names of the records exchanged between the event logger and the plan
//! rebuilder.

pub use crate::constants::CYCLE_END;

pub const LOG_SESSION: &str = "log_session";

pub const MERGED_PLAN: &str = "merged_plan";
pub const FINALIZED_TASK: &str = "finalized_task";
pub const FINALIZED_EVENT: &str = "finalized_event";
pub const GARBAGE_TASK: &str = "garbage_task";
pub const GARBAGE_EVENT: &str = "garbage_event";

pub const ADDED_EDGE: &str = "added_edge";
pub const UPDATED_EDGE_INFO: &str = "updated_edge_info";
pub const REMOVED_EDGE: &str = "removed_edge";

pub const ADDED_MISSION: &str = "added_mission";
pub const UNMARKED_MISSION: &str = "unmarked_mission";
pub const ADDED_PERMANENT: &str = "added_permanent";
pub const UNMARKED_PERMANENT: &str = "unmarked_permanent";

pub const TASK_ARGUMENTS_UPDATED: &str = "task_arguments_updated";
pub const TASK_FAILED_TO_START: &str = "task_failed_to_start";

pub const GENERATOR_CALLED: &str = "generator_called";
pub const GENERATOR_FIRED: &str = "generator_fired";
pub const GENERATOR_EMIT_FAILED: &str = "generator_emit_failed";
pub const GENERATOR_PROPAGATE_EVENTS: &str = "generator_propagate_events";
