//! Wire-side representation of values and the dump/load hooks of plan
//! objects.

use std::sync::Arc;

use crate::error::{PlanLogError, Result};
use crate::plan::{
  DelayedArgument, EventGenerator, ExceptionValue, Model, ModelKind, PlanObject, Task, Value,
};
use crate::types::{ObjectId, RemoteRef, Siblings, Timestamp};

use super::Marshaller;

/// One value as written to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Marshalled {
  Nil,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Symbol(String),
  Time(Timestamp),
  List(Vec<Marshalled>),
  Map(Vec<(Marshalled, Marshalled)>),
  /// Reference to an object the receiver already knows
  Ref(RemoteRef),
  /// Sender-side id of a member of the group being dumped
  Id(ObjectId),
  /// Full payload of an object
  Object(Box<Dumped>),
  /// A value with no log representation; never survives encoding
  Opaque(String),
}

impl Marshalled {
  pub fn symbol(value: impl Into<String>) -> Self {
    Marshalled::Symbol(value.into())
  }

  pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Marshalled)>) -> Self {
    Marshalled::Map(
      entries
        .into_iter()
        .map(|(key, value)| (Marshalled::Symbol(key.into()), value))
        .collect(),
    )
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Marshalled::Str(value) | Marshalled::Symbol(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Marshalled::Int(value) => Some(*value),
      _ => None,
    }
  }

  pub fn as_time(&self) -> Option<Timestamp> {
    match self {
      Marshalled::Time(value) => Some(*value),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Marshalled]> {
    match self {
      Marshalled::List(values) => Some(values),
      _ => None,
    }
  }

  pub fn as_dumped(&self) -> Option<&Dumped> {
    match self {
      Marshalled::Object(dumped) => Some(dumped),
      _ => None,
    }
  }

  pub fn get(&self, key: &str) -> Option<&Marshalled> {
    match self {
      Marshalled::Map(entries) => entries
        .iter()
        .find(|(candidate, _)| candidate.as_str() == Some(key))
        .map(|(_, value)| value),
      _ => None,
    }
  }

  /// Short description used in error messages.
  pub fn describe(&self) -> String {
    match self {
      Marshalled::Nil => "nil".to_string(),
      Marshalled::Bool(value) => value.to_string(),
      Marshalled::Int(value) => value.to_string(),
      Marshalled::Float(value) => value.to_string(),
      Marshalled::Str(value) => format!("{value:?}"),
      Marshalled::Symbol(value) => format!(":{value}"),
      Marshalled::Time(value) => value.to_string(),
      Marshalled::List(values) => format!("list of {}", values.len()),
      Marshalled::Map(entries) => format!("map of {}", entries.len()),
      Marshalled::Ref(remote) => format!("ref {remote}"),
      Marshalled::Id(id) => format!("id {id}"),
      Marshalled::Object(dumped) => dumped.describe(),
      Marshalled::Opaque(type_name) => format!("#<{type_name}>"),
    }
  }

  /// Direct sub-values with the path segment leading to each.
  ///
  /// Object fields come before container elements.
  pub fn children(&self) -> Vec<(String, &Marshalled)> {
    match self {
      Marshalled::List(values) => values
        .iter()
        .enumerate()
        .map(|(idx, value)| (format!("[{idx}]"), value))
        .collect(),
      Marshalled::Map(entries) => {
        let mut children = Vec::with_capacity(entries.len() * 2);
        for (idx, (key, value)) in entries.iter().enumerate() {
          children.push((format!(".keys[{idx}]"), key));
          let segment = match key.as_str() {
            Some(name) => format!("[{name:?}]"),
            None => format!(".values[{idx}]"),
          };
          children.push((segment, value));
        }
        children
      }
      Marshalled::Object(dumped) => dumped.fields(),
      _ => Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpedModel {
  pub remote_siblings: Siblings,
  pub name: Option<String>,
  pub kind: ModelKind,
  pub supermodel: Option<Marshalled>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpedTask {
  pub remote_siblings: Siblings,
  pub model: Marshalled,
  pub arguments: Vec<(String, Marshalled)>,
  pub addition_time: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpedEvent {
  pub remote_siblings: Siblings,
  pub model: Marshalled,
  pub controlable: bool,
  pub addition_time: Option<Timestamp>,
}

/// Event bound to a task, identified through its task.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpedTaskEvent {
  pub task: Marshalled,
  pub symbol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpedException {
  pub class_name: String,
  pub message: String,
  pub original_exceptions: Vec<Marshalled>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpedDelayed {
  pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dumped {
  Model(DumpedModel),
  Task(DumpedTask),
  Event(DumpedEvent),
  TaskEvent(DumpedTaskEvent),
  Exception(DumpedException),
  Delayed(DumpedDelayed),
}

impl Dumped {
  pub fn as_load(&self) -> &dyn DRobyLoad {
    match self {
      Dumped::Model(dumped) => dumped,
      Dumped::Task(dumped) => dumped,
      Dumped::Event(dumped) => dumped,
      Dumped::TaskEvent(dumped) => dumped,
      Dumped::Exception(dumped) => dumped,
      Dumped::Delayed(dumped) => dumped,
    }
  }

  pub fn remote_siblings(&self) -> Option<&Siblings> {
    self.as_load().remote_siblings()
  }

  pub fn describe(&self) -> String {
    match self {
      Dumped::Model(model) => format!(
        "model {}",
        model.name.as_deref().unwrap_or("<anonymous>")
      ),
      Dumped::Task(task) => format!("task {}", describe_siblings(&task.remote_siblings)),
      Dumped::Event(event) => format!("event {}", describe_siblings(&event.remote_siblings)),
      Dumped::TaskEvent(event) => format!("event {} of {}", event.symbol, event.task.describe()),
      Dumped::Exception(exception) => format!("exception {}", exception.class_name),
      Dumped::Delayed(delayed) => format!("delayed argument {}", delayed.description),
    }
  }

  fn fields(&self) -> Vec<(String, &Marshalled)> {
    match self {
      Dumped::Model(model) => model
        .supermodel
        .iter()
        .map(|supermodel| ("@supermodel".to_string(), supermodel))
        .collect(),
      Dumped::Task(task) => {
        let mut fields = vec![("@model".to_string(), &task.model)];
        fields.extend(
          task
            .arguments
            .iter()
            .map(|(key, value)| (format!("@arguments[{key:?}]"), value)),
        );
        fields
      }
      Dumped::Event(event) => vec![("@model".to_string(), &event.model)],
      Dumped::TaskEvent(event) => vec![("@task".to_string(), &event.task)],
      Dumped::Exception(exception) => exception
        .original_exceptions
        .iter()
        .enumerate()
        .map(|(idx, original)| (format!("@original_exceptions[{idx}]"), original))
        .collect(),
      Dumped::Delayed(_) => Vec::new(),
    }
  }
}

fn describe_siblings(siblings: &Siblings) -> String {
  let names: Vec<String> = siblings
    .iter()
    .map(|(peer, id)| format!("{id}@{peer}"))
    .collect();
  format!("[{}]", names.join(", "))
}

// ============================================================================
// Dump side
// ============================================================================

/// Local values that have a structured log representation.
pub trait DRobyDump {
  fn droby_dump(&self, marshaller: &mut Marshaller) -> Dumped;
}

impl DRobyDump for PlanObject {
  fn droby_dump(&self, marshaller: &mut Marshaller) -> Dumped {
    match self {
      PlanObject::Task(task) => dump_task(task, self, marshaller),
      PlanObject::Event(event) => dump_event(event, self, marshaller),
      PlanObject::Model(model) => dump_model(model, self, marshaller),
    }
  }
}

fn dump_model(model: &Arc<Model>, object: &PlanObject, marshaller: &mut Marshaller) -> Dumped {
  let supermodel = model
    .supermodel()
    .map(|supermodel| marshaller.dump(&Value::from(supermodel.clone())));
  Dumped::Model(DumpedModel {
    remote_siblings: marshaller.siblings_for(object),
    name: model.name().map(str::to_string),
    kind: model.kind(),
    supermodel,
  })
}

fn dump_task(task: &Arc<Task>, object: &PlanObject, marshaller: &mut Marshaller) -> Dumped {
  let model = marshaller.dump(&Value::from(task.model().clone()));
  let arguments = task
    .arguments()
    .iter()
    .map(|(key, value)| (key.clone(), marshaller.dump(value)))
    .collect();
  Dumped::Task(DumpedTask {
    remote_siblings: marshaller.siblings_for(object),
    model,
    arguments,
    addition_time: task.addition_time(),
  })
}

fn dump_event(event: &Arc<EventGenerator>, object: &PlanObject, marshaller: &mut Marshaller) -> Dumped {
  if let (Some(task), Some(symbol)) = (event.task(), event.symbol()) {
    return Dumped::TaskEvent(DumpedTaskEvent {
      task: marshaller.dump(&Value::from(task)),
      symbol: symbol.to_string(),
    });
  }

  let model = match event.model() {
    Some(model) => marshaller.dump(&Value::from(model.clone())),
    None => Marshalled::Nil,
  };
  Dumped::Event(DumpedEvent {
    remote_siblings: marshaller.siblings_for(object),
    model,
    controlable: event.controlable(),
    addition_time: event.addition_time(),
  })
}

impl DRobyDump for DelayedArgument {
  fn droby_dump(&self, _marshaller: &mut Marshaller) -> Dumped {
    Dumped::Delayed(DumpedDelayed {
      description: self.description.clone(),
    })
  }
}

impl DRobyDump for ExceptionValue {
  fn droby_dump(&self, marshaller: &mut Marshaller) -> Dumped {
    let original_exceptions = self
      .original_exceptions
      .iter()
      .map(|original| Marshalled::Object(Box::new(original.droby_dump(marshaller))))
      .collect();
    Dumped::Exception(DumpedException {
      class_name: self.class_name.clone(),
      message: self.message.clone(),
      original_exceptions,
    })
  }
}

// ============================================================================
// Load side
// ============================================================================

/// Payloads that can be turned back into local values.
///
/// Payloads with `remote_siblings` are distributed entities: they are
/// registered once proxied. Payloads without are value-like and are rebuilt
/// every time they are received.
#[allow(unused_variables)]
pub trait DRobyLoad {
  fn remote_siblings(&self) -> Option<&Siblings> {
    None
  }

  /// Rebuild a value-like payload from objects that are already known.
  ///
  /// `Ok(None)` means a distributed entity would have to be created.
  fn resolve_value(&self, marshaller: &mut Marshaller) -> Result<Option<Value>> {
    Ok(None)
  }

  /// Build a new local object for this payload.
  fn proxy(&self, marshaller: &mut Marshaller) -> Result<Value>;

  /// Apply the payload's fields to `local`.
  fn update(&self, marshaller: &mut Marshaller, local: &Value, fresh_proxy: bool) -> Result<()> {
    Ok(())
  }
}

impl DRobyLoad for DumpedModel {
  fn remote_siblings(&self) -> Option<&Siblings> {
    Some(&self.remote_siblings)
  }

  fn proxy(&self, marshaller: &mut Marshaller) -> Result<Value> {
    let supermodel = match &self.supermodel {
      Some(supermodel) => {
        let resolved = marshaller.local_model(supermodel)?;
        Some(expect_model(&resolved, supermodel)?)
      }
      None => None,
    };
    Ok(Value::from(Model::new(
      self.name.as_deref(),
      self.kind,
      supermodel,
    )))
  }
}

impl DRobyLoad for DumpedTask {
  fn remote_siblings(&self) -> Option<&Siblings> {
    Some(&self.remote_siblings)
  }

  fn proxy(&self, marshaller: &mut Marshaller) -> Result<Value> {
    let model = marshaller.local_model(&self.model)?;
    let model = expect_model(&model, &self.model)?;
    Ok(Value::from(Task::new(model)))
  }

  fn update(&self, marshaller: &mut Marshaller, local: &Value, _fresh_proxy: bool) -> Result<()> {
    let task = local.as_task().cloned().ok_or_else(|| {
      PlanLogError::NoLocalObject(format!("{local} is not a task"))
    })?;
    for (key, value) in &self.arguments {
      let value = marshaller.local_object(value, true)?;
      task.set_argument(key, value);
    }
    if self.addition_time.is_some() {
      task.set_addition_time(self.addition_time);
    }
    Ok(())
  }
}

impl DRobyLoad for DumpedEvent {
  fn remote_siblings(&self) -> Option<&Siblings> {
    Some(&self.remote_siblings)
  }

  fn proxy(&self, marshaller: &mut Marshaller) -> Result<Value> {
    let model = match &self.model {
      Marshalled::Nil => Model::new(None, ModelKind::Event, None),
      model => {
        let resolved = marshaller.local_model(model)?;
        expect_model(&resolved, model)?
      }
    };
    Ok(Value::from(EventGenerator::new(model, self.controlable)))
  }

  fn update(&self, _marshaller: &mut Marshaller, local: &Value, _fresh_proxy: bool) -> Result<()> {
    let event = local.as_event().ok_or_else(|| {
      PlanLogError::NoLocalObject(format!("{local} is not an event"))
    })?;
    if self.addition_time.is_some() {
      event.set_addition_time(self.addition_time);
    }
    Ok(())
  }
}

impl DumpedTaskEvent {
  fn event_of(&self, task: &Value) -> Result<Value> {
    let task = task.as_task().ok_or_else(|| {
      PlanLogError::NoLocalObject(format!("{task} is not a task"))
    })?;
    task
      .event(&self.symbol)
      .cloned()
      .map(Value::from)
      .ok_or_else(|| {
        PlanLogError::NoLocalObject(format!("task {} has no event {}", task.id(), self.symbol))
      })
  }
}

impl DRobyLoad for DumpedTaskEvent {
  fn resolve_value(&self, marshaller: &mut Marshaller) -> Result<Option<Value>> {
    match marshaller.find_local_object(&self.task)? {
      Some(task) => self.event_of(&task).map(Some),
      None => Ok(None),
    }
  }

  fn proxy(&self, marshaller: &mut Marshaller) -> Result<Value> {
    let task = marshaller.local_object(&self.task, true)?;
    self.event_of(&task)
  }
}

impl DumpedException {
  fn build(&self, originals: Vec<ExceptionValue>) -> Value {
    Value::from(ExceptionValue {
      class_name: self.class_name.clone(),
      message: self.message.clone(),
      original_exceptions: originals,
    })
  }
}

fn expect_exception(value: &Value, marshalled: &Marshalled) -> Result<ExceptionValue> {
  value.as_exception().cloned().ok_or_else(|| {
    PlanLogError::NoLocalObject(format!(
      "{} is not an exception",
      marshalled.describe()
    ))
  })
}

impl DRobyLoad for DumpedException {
  fn resolve_value(&self, marshaller: &mut Marshaller) -> Result<Option<Value>> {
    let mut originals = Vec::with_capacity(self.original_exceptions.len());
    for original in &self.original_exceptions {
      let value = marshaller.local_object(original, false)?;
      originals.push(expect_exception(&value, original)?);
    }
    Ok(Some(self.build(originals)))
  }

  fn proxy(&self, marshaller: &mut Marshaller) -> Result<Value> {
    let mut originals = Vec::with_capacity(self.original_exceptions.len());
    for original in &self.original_exceptions {
      let value = marshaller.local_object(original, true)?;
      originals.push(expect_exception(&value, original)?);
    }
    Ok(self.build(originals))
  }
}

impl DRobyLoad for DumpedDelayed {
  fn resolve_value(&self, _marshaller: &mut Marshaller) -> Result<Option<Value>> {
    Ok(Some(Value::Delayed(DelayedArgument::new(
      self.description.clone(),
    ))))
  }

  fn proxy(&self, marshaller: &mut Marshaller) -> Result<Value> {
    self
      .resolve_value(marshaller)
      .map(|value| value.unwrap_or(Value::Nil))
  }
}

fn expect_model(value: &Value, marshalled: &Marshalled) -> Result<Arc<Model>> {
  value.as_model().cloned().ok_or_else(|| {
    PlanLogError::NoLocalObject(format!("{} is not a model", marshalled.describe()))
  })
}
