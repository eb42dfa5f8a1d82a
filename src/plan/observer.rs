//! Change notifications emitted by a [`super::Plan`].
//!
//! Observers are registered explicitly on the plan. Every method defaults to
//! a no-op so an observer only implements what it records.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{PlanLogError, Result};

use super::{Emission, EventGenerator, PlanObject, RelationKind, Task, Value};

/// How an event propagation reached its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropagationKind {
  Call,
  Signal,
  Forward,
}

impl PropagationKind {
  pub fn as_str(self) -> &'static str {
    match self {
      PropagationKind::Call => "call",
      PropagationKind::Signal => "signal",
      PropagationKind::Forward => "forward",
    }
  }
}

impl fmt::Display for PropagationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for PropagationKind {
  type Err = PlanLogError;

  fn from_str(raw: &str) -> Result<Self> {
    match raw {
      "call" => Ok(PropagationKind::Call),
      "signal" => Ok(PropagationKind::Signal),
      "forward" => Ok(PropagationKind::Forward),
      _ => Err(PlanLogError::InvalidRecord(format!(
        "unknown propagation kind: {raw}"
      ))),
    }
  }
}

/// One edge in a merge notification.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeChange {
  pub relation: RelationKind,
  pub parent: PlanObject,
  pub child: PlanObject,
  pub info: Value,
}

/// Objects and edges added to a plan in one step.
#[derive(Debug, Clone, Default)]
pub struct PlanMerge {
  pub tasks: Vec<Arc<Task>>,
  pub events: Vec<Arc<EventGenerator>>,
  pub edges: Vec<EdgeChange>,
}

impl PlanMerge {
  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty() && self.events.is_empty() && self.edges.is_empty()
  }
}

#[allow(unused_variables)]
pub trait PlanObserver: Send {
  fn merged_plan(&mut self, merge: &PlanMerge) -> Result<()> {
    Ok(())
  }

  fn finalized_task(&mut self, task: &Arc<Task>) -> Result<()> {
    Ok(())
  }

  fn finalized_event(&mut self, event: &Arc<EventGenerator>) -> Result<()> {
    Ok(())
  }

  fn garbage_task(&mut self, task: &Arc<Task>) -> Result<()> {
    Ok(())
  }

  fn garbage_event(&mut self, event: &Arc<EventGenerator>) -> Result<()> {
    Ok(())
  }

  fn added_edge(&mut self, edge: &EdgeChange) -> Result<()> {
    Ok(())
  }

  fn updated_edge_info(&mut self, edge: &EdgeChange) -> Result<()> {
    Ok(())
  }

  fn removed_edge(
    &mut self,
    relation: RelationKind,
    parent: &PlanObject,
    child: &PlanObject,
  ) -> Result<()> {
    Ok(())
  }

  fn mission_changed(&mut self, object: &PlanObject, mission: bool) -> Result<()> {
    Ok(())
  }

  fn permanent_changed(&mut self, object: &PlanObject, permanent: bool) -> Result<()> {
    Ok(())
  }

  fn task_arguments_updated(&mut self, task: &Arc<Task>, key: &str, value: &Value) -> Result<()> {
    Ok(())
  }

  fn generator_called(&mut self, event: &Arc<EventGenerator>, context: &Value) -> Result<()> {
    Ok(())
  }

  fn generator_fired(&mut self, event: &Arc<EventGenerator>, emission: &Emission) -> Result<()> {
    Ok(())
  }

  fn generator_emit_failed(&mut self, event: &Arc<EventGenerator>, error: &Value) -> Result<()> {
    Ok(())
  }

  fn generator_propagate_events(
    &mut self,
    kind: PropagationKind,
    sources: &[Arc<EventGenerator>],
    target: &Arc<EventGenerator>,
    propagation_id: u64,
  ) -> Result<()> {
    Ok(())
  }

  fn task_failed_to_start(&mut self, task: &Arc<Task>, reason: &Value) -> Result<()> {
    Ok(())
  }
}
