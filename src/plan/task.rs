//! Tasks and their arguments.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::types::{ObjectId, Timestamp};

use super::{EventGenerator, Model, Value};

/// Events every task has, with their controllability.
pub const TASK_EVENTS: &[(&str, bool)] = &[
  ("start", true),
  ("success", false),
  ("failed", false),
  ("stop", false),
];

#[derive(Debug, Default)]
struct TaskState {
  arguments: IndexMap<String, Value>,
  addition_time: Option<Timestamp>,
  failure_reason: Option<Value>,
}

pub struct Task {
  id: ObjectId,
  model: Arc<Model>,
  events: IndexMap<String, Arc<EventGenerator>>,
  state: Mutex<TaskState>,
}

impl Task {
  pub fn new(model: Arc<Model>) -> Arc<Self> {
    Arc::new_cyclic(|task| {
      let events = TASK_EVENTS
        .iter()
        .map(|(symbol, controlable)| {
          (
            symbol.to_string(),
            EventGenerator::bound(task.clone(), symbol, *controlable),
          )
        })
        .collect();
      Self {
        id: ObjectId::allocate(),
        model,
        events,
        state: Mutex::new(TaskState::default()),
      }
    })
  }

  pub fn with_arguments<K: Into<String>>(
    model: Arc<Model>,
    arguments: impl IntoIterator<Item = (K, Value)>,
  ) -> Arc<Self> {
    let task = Self::new(model);
    {
      let mut state = task.state.lock();
      for (key, value) in arguments {
        state.arguments.insert(key.into(), value);
      }
    }
    task
  }

  pub fn id(&self) -> ObjectId {
    self.id
  }

  pub fn model(&self) -> &Arc<Model> {
    &self.model
  }

  pub fn event(&self, symbol: &str) -> Option<&Arc<EventGenerator>> {
    self.events.get(symbol)
  }

  pub fn events(&self) -> impl Iterator<Item = &Arc<EventGenerator>> {
    self.events.values()
  }

  pub fn arguments(&self) -> IndexMap<String, Value> {
    self.state.lock().arguments.clone()
  }

  pub fn argument(&self, key: &str) -> Option<Value> {
    self.state.lock().arguments.get(key).cloned()
  }

  pub(crate) fn set_argument(&self, key: &str, value: Value) {
    self.state.lock().arguments.insert(key.to_string(), value);
  }

  /// Keys of arguments that are still delayed.
  pub fn delayed_arguments(&self) -> Vec<String> {
    self
      .state
      .lock()
      .arguments
      .iter()
      .filter(|(_, value)| matches!(value, Value::Delayed(_)))
      .map(|(key, _)| key.clone())
      .collect()
  }

  pub fn addition_time(&self) -> Option<Timestamp> {
    self.state.lock().addition_time
  }

  pub fn set_addition_time(&self, time: Option<Timestamp>) {
    self.state.lock().addition_time = time;
  }

  pub fn failure_reason(&self) -> Option<Value> {
    self.state.lock().failure_reason.clone()
  }

  pub fn failed_to_start(&self) -> bool {
    self.state.lock().failure_reason.is_some()
  }

  pub(crate) fn set_failure_reason(&self, reason: Value) {
    self.state.lock().failure_reason = Some(reason);
  }

  pub fn running(&self) -> bool {
    self.emitted("start") && !self.emitted("stop")
  }

  pub fn finished(&self) -> bool {
    self.emitted("stop")
  }

  fn emitted(&self, symbol: &str) -> bool {
    self.events.get(symbol).is_some_and(|event| event.emitted())
  }
}

impl fmt::Debug for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("id", &self.id)
      .field("model", &self.model.name())
      .finish()
  }
}
