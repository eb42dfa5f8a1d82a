//! Values handed to and produced by the marshaller.

use std::fmt;
use std::sync::Arc;

use crate::types::Timestamp;

use super::{EventGenerator, Model, PlanObject, Task};

/// An argument whose value is only known once the task is about to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedArgument {
  pub description: String,
}

impl DelayedArgument {
  pub fn new(description: impl Into<String>) -> Self {
    Self {
      description: description.into(),
    }
  }
}

/// An exception as recorded in the log, with the chain it originates from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionValue {
  pub class_name: String,
  pub message: String,
  pub original_exceptions: Vec<ExceptionValue>,
}

impl ExceptionValue {
  pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      class_name: class_name.into(),
      message: message.into(),
      original_exceptions: Vec::new(),
    }
  }

  pub fn caused_by(mut self, original: ExceptionValue) -> Self {
    self.original_exceptions.push(original);
    self
  }

  /// Class names from this exception down its first-cause chain.
  pub fn chain(&self) -> Vec<&str> {
    let mut chain = vec![self.class_name.as_str()];
    let mut current = self.original_exceptions.first();
    while let Some(exception) = current {
      chain.push(exception.class_name.as_str());
      current = exception.original_exceptions.first();
    }
    chain
  }
}

/// A value that has no log representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opaque {
  pub type_name: String,
}

impl Opaque {
  pub fn new(type_name: impl Into<String>) -> Self {
    Self {
      type_name: type_name.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Nil,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Symbol(String),
  Time(Timestamp),
  List(Vec<Value>),
  Map(Vec<(Value, Value)>),
  Object(PlanObject),
  Delayed(DelayedArgument),
  Exception(Box<ExceptionValue>),
  Opaque(Opaque),
}

impl Value {
  pub fn str(value: impl Into<String>) -> Self {
    Value::Str(value.into())
  }

  pub fn symbol(value: impl Into<String>) -> Self {
    Value::Symbol(value.into())
  }

  pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
    Value::Map(
      entries
        .into_iter()
        .map(|(key, value)| (Value::Symbol(key.into()), value))
        .collect(),
    )
  }

  pub fn is_nil(&self) -> bool {
    matches!(self, Value::Nil)
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(value) => Some(*value),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(value) => Some(*value),
      _ => None,
    }
  }

  /// String or symbol contents.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(value) | Value::Symbol(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_time(&self) -> Option<Timestamp> {
    match self {
      Value::Time(value) => Some(*value),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Value]> {
    match self {
      Value::List(values) => Some(values),
      _ => None,
    }
  }

  pub fn as_object(&self) -> Option<&PlanObject> {
    match self {
      Value::Object(object) => Some(object),
      _ => None,
    }
  }

  pub fn as_task(&self) -> Option<&Arc<Task>> {
    match self {
      Value::Object(PlanObject::Task(task)) => Some(task),
      _ => None,
    }
  }

  pub fn as_event(&self) -> Option<&Arc<EventGenerator>> {
    match self {
      Value::Object(PlanObject::Event(event)) => Some(event),
      _ => None,
    }
  }

  pub fn as_model(&self) -> Option<&Arc<Model>> {
    match self {
      Value::Object(PlanObject::Model(model)) => Some(model),
      _ => None,
    }
  }

  pub fn as_exception(&self) -> Option<&ExceptionValue> {
    match self {
      Value::Exception(exception) => Some(exception),
      _ => None,
    }
  }

  /// Lookup in a map keyed by strings or symbols.
  pub fn get(&self, key: &str) -> Option<&Value> {
    match self {
      Value::Map(entries) => entries
        .iter()
        .find(|(candidate, _)| candidate.as_str() == Some(key))
        .map(|(_, value)| value),
      _ => None,
    }
  }
}

impl From<PlanObject> for Value {
  fn from(object: PlanObject) -> Self {
    Value::Object(object)
  }
}

impl From<Arc<Task>> for Value {
  fn from(task: Arc<Task>) -> Self {
    Value::Object(PlanObject::Task(task))
  }
}

impl From<Arc<EventGenerator>> for Value {
  fn from(event: Arc<EventGenerator>) -> Self {
    Value::Object(PlanObject::Event(event))
  }
}

impl From<Arc<Model>> for Value {
  fn from(model: Arc<Model>) -> Self {
    Value::Object(PlanObject::Model(model))
  }
}

impl From<i64> for Value {
  fn from(value: i64) -> Self {
    Value::Int(value)
  }
}

impl From<bool> for Value {
  fn from(value: bool) -> Self {
    Value::Bool(value)
  }
}

impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Value::Str(value.to_string())
  }
}

impl From<ExceptionValue> for Value {
  fn from(value: ExceptionValue) -> Self {
    Value::Exception(Box::new(value))
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Nil => f.write_str("nil"),
      Value::Bool(value) => write!(f, "{value}"),
      Value::Int(value) => write!(f, "{value}"),
      Value::Float(value) => write!(f, "{value}"),
      Value::Str(value) => write!(f, "{value:?}"),
      Value::Symbol(value) => write!(f, ":{value}"),
      Value::Time(value) => write!(f, "{value}"),
      Value::List(values) => {
        f.write_str("[")?;
        for (idx, value) in values.iter().enumerate() {
          if idx > 0 {
            f.write_str(", ")?;
          }
          write!(f, "{value}")?;
        }
        f.write_str("]")
      }
      Value::Map(entries) => {
        f.write_str("{")?;
        for (idx, (key, value)) in entries.iter().enumerate() {
          if idx > 0 {
            f.write_str(", ")?;
          }
          write!(f, "{key} => {value}")?;
        }
        f.write_str("}")
      }
      Value::Object(object) => write!(f, "{object}"),
      Value::Delayed(delayed) => write!(f, "delayed({})", delayed.description),
      Value::Exception(exception) => {
        write!(f, "{}: {}", exception.class_name, exception.message)
      }
      Value::Opaque(opaque) => write!(f, "#<{}>", opaque.type_name),
    }
  }
}
