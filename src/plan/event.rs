//! Event generators: free events and the events bound to a task.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::{ObjectId, Timestamp};

use super::{Model, Task, Value};

/// One emission of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
  /// Emission counter, unique within the emitting process
  pub id: u64,
  pub time: Timestamp,
  pub context: Value,
  /// Propagation batch the emission happened in
  pub propagation_id: u64,
}

/// One call of a controlable event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCall {
  pub time: Timestamp,
  pub context: Value,
}

#[derive(Debug, Default)]
struct EventState {
  addition_time: Option<Timestamp>,
  history: Vec<Emission>,
  calls: Vec<EventCall>,
  emit_failures: Vec<Value>,
}

#[derive(Debug)]
struct TaskBinding {
  task: Weak<Task>,
  symbol: String,
}

pub struct EventGenerator {
  id: ObjectId,
  model: Option<Arc<Model>>,
  controlable: bool,
  binding: Option<TaskBinding>,
  state: Mutex<EventState>,
}

impl EventGenerator {
  /// A free event, not bound to any task.
  pub fn new(model: Arc<Model>, controlable: bool) -> Arc<Self> {
    Arc::new(Self {
      id: ObjectId::allocate(),
      model: Some(model),
      controlable,
      binding: None,
      state: Mutex::new(EventState::default()),
    })
  }

  pub(crate) fn bound(task: Weak<Task>, symbol: &str, controlable: bool) -> Arc<Self> {
    Arc::new(Self {
      id: ObjectId::allocate(),
      model: None,
      controlable,
      binding: Some(TaskBinding {
        task,
        symbol: symbol.to_string(),
      }),
      state: Mutex::new(EventState::default()),
    })
  }

  pub fn id(&self) -> ObjectId {
    self.id
  }

  pub fn model(&self) -> Option<&Arc<Model>> {
    self.model.as_ref()
  }

  pub fn controlable(&self) -> bool {
    self.controlable
  }

  pub fn is_free(&self) -> bool {
    self.binding.is_none()
  }

  /// Task this event belongs to, while that task is alive.
  pub fn task(&self) -> Option<Arc<Task>> {
    self.binding.as_ref().and_then(|binding| binding.task.upgrade())
  }

  pub fn symbol(&self) -> Option<&str> {
    self.binding.as_ref().map(|binding| binding.symbol.as_str())
  }

  pub fn addition_time(&self) -> Option<Timestamp> {
    self.state.lock().addition_time
  }

  pub fn set_addition_time(&self, time: Option<Timestamp>) {
    self.state.lock().addition_time = time;
  }

  pub fn emitted(&self) -> bool {
    !self.state.lock().history.is_empty()
  }

  pub fn history(&self) -> Vec<Emission> {
    self.state.lock().history.clone()
  }

  pub fn last_emission(&self) -> Option<Emission> {
    self.state.lock().history.last().cloned()
  }

  pub fn calls(&self) -> Vec<EventCall> {
    self.state.lock().calls.clone()
  }

  pub fn emit_failures(&self) -> Vec<Value> {
    self.state.lock().emit_failures.clone()
  }

  pub(crate) fn record_emission(&self, emission: Emission) {
    self.state.lock().history.push(emission);
  }

  pub(crate) fn record_call(&self, call: EventCall) {
    self.state.lock().calls.push(call);
  }

  pub(crate) fn record_emit_failure(&self, error: Value) {
    self.state.lock().emit_failures.push(error);
  }
}

impl fmt::Debug for EventGenerator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventGenerator")
      .field("id", &self.id)
      .field("symbol", &self.symbol())
      .field("controlable", &self.controlable)
      .finish()
  }
}
