//! Handles on objects that have an identity in a plan.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::distributed::Identifiable;
use crate::types::ObjectId;

use super::{EventGenerator, Model, Task};

#[derive(Clone)]
pub enum PlanObject {
  Task(Arc<Task>),
  Event(Arc<EventGenerator>),
  Model(Arc<Model>),
}

impl PlanObject {
  pub fn id(&self) -> ObjectId {
    match self {
      PlanObject::Task(task) => task.id(),
      PlanObject::Event(event) => event.id(),
      PlanObject::Model(model) => model.id(),
    }
  }

  pub fn as_task(&self) -> Option<&Arc<Task>> {
    match self {
      PlanObject::Task(task) => Some(task),
      _ => None,
    }
  }

  pub fn as_event(&self) -> Option<&Arc<EventGenerator>> {
    match self {
      PlanObject::Event(event) => Some(event),
      _ => None,
    }
  }

  pub fn as_model(&self) -> Option<&Arc<Model>> {
    match self {
      PlanObject::Model(model) => Some(model),
      _ => None,
    }
  }
}

impl From<Arc<Task>> for PlanObject {
  fn from(task: Arc<Task>) -> Self {
    PlanObject::Task(task)
  }
}

impl From<&Arc<Task>> for PlanObject {
  fn from(task: &Arc<Task>) -> Self {
    PlanObject::Task(task.clone())
  }
}

impl From<Arc<EventGenerator>> for PlanObject {
  fn from(event: Arc<EventGenerator>) -> Self {
    PlanObject::Event(event)
  }
}

impl From<&Arc<EventGenerator>> for PlanObject {
  fn from(event: &Arc<EventGenerator>) -> Self {
    PlanObject::Event(event.clone())
  }
}

impl Identifiable for PlanObject {
  fn droby_id(&self) -> ObjectId {
    self.id()
  }

  fn model_name(&self) -> Option<String> {
    self
      .as_model()
      .and_then(|model| model.name().map(str::to_string))
  }
}

impl PartialEq for PlanObject {
  fn eq(&self, other: &Self) -> bool {
    self.id() == other.id()
  }
}

impl Eq for PlanObject {}

impl Hash for PlanObject {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id().hash(state);
  }
}

impl fmt::Display for PlanObject {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PlanObject::Task(task) => write!(
        f,
        "task({} {})",
        task.id(),
        task.model().name().unwrap_or("<anonymous>")
      ),
      PlanObject::Event(event) => match (event.task(), event.symbol()) {
        (Some(task), Some(symbol)) => write!(f, "event({}/{symbol})", task.id()),
        _ => write!(f, "event({})", event.id()),
      },
      PlanObject::Model(model) => {
        write!(f, "model({})", model.name().unwrap_or("<anonymous>"))
      }
    }
  }
}

impl fmt::Debug for PlanObject {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}
