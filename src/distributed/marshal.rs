//! Conversion between local values and their log representation.
//!
//! A [`Marshaller`] owns the identity registry of one session and is bound to
//! the peer on the other side of the log. Dumping replaces objects the peer
//! already knows with references; loading resolves references and builds
//! proxies for full payloads.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};

use crate::error::{PlanLogError, Result};
use crate::plan::{ModelNamespace, PlanObject, Value};
use crate::types::{ObjectId, PeerId, RemoteRef, Siblings};

use super::{DRobyDump, Dumped, Marshalled, ObjectManager};

pub struct Marshaller {
  manager: ObjectManager<PlanObject>,
  remote_peer: PeerId,
  namespace: ModelNamespace,
  dump_context: Option<HashSet<ObjectId>>,
  in_flight: HashSet<ObjectId>,
  load_context: HashMap<ObjectId, Value>,
}

impl Marshaller {
  pub fn new(manager: ObjectManager<PlanObject>, remote_peer: PeerId) -> Self {
    Self {
      manager,
      remote_peer,
      namespace: ModelNamespace::new(),
      dump_context: None,
      in_flight: HashSet::new(),
      load_context: HashMap::new(),
    }
  }

  /// Constant namespace searched when a model is neither registered nor
  /// known by name.
  pub fn with_namespace(mut self, namespace: ModelNamespace) -> Self {
    self.namespace = namespace;
    self
  }

  pub fn namespace(&self) -> &ModelNamespace {
    &self.namespace
  }

  pub fn namespace_mut(&mut self) -> &mut ModelNamespace {
    &mut self.namespace
  }

  pub fn object_manager(&self) -> &ObjectManager<PlanObject> {
    &self.manager
  }

  pub fn object_manager_mut(&mut self) -> &mut ObjectManager<PlanObject> {
    &mut self.manager
  }

  pub fn local_peer(&self) -> &PeerId {
    self.manager.local_id()
  }

  pub fn remote_peer(&self) -> &PeerId {
    &self.remote_peer
  }

  pub fn set_remote_peer(&mut self, peer: PeerId) {
    self.remote_peer = peer;
  }

  /// Whether a group dump is in progress.
  pub fn in_dump_group(&self) -> bool {
    self.dump_context.is_some()
  }

  /// Sibling map written in the payload of `object`.
  pub fn siblings_for(&self, object: &PlanObject) -> Siblings {
    let mut siblings = self
      .manager
      .siblings_of(object)
      .cloned()
      .unwrap_or_default();
    siblings.insert(self.manager.local_id().clone(), object.id());
    siblings
  }

  // ==========================================================================
  // Dump
  // ==========================================================================

  /// Convert a local value into its log representation.
  ///
  /// An object reached again while its own payload is being written is
  /// written as [`Marshalled::Id`]. The loader resolves it once the
  /// enclosing payload is proxied and registered.
  pub fn dump(&mut self, value: &Value) -> Marshalled {
    match value {
      Value::Nil => Marshalled::Nil,
      Value::Bool(value) => Marshalled::Bool(*value),
      Value::Int(value) => Marshalled::Int(*value),
      Value::Float(value) => Marshalled::Float(*value),
      Value::Str(value) => Marshalled::Str(value.clone()),
      Value::Symbol(value) => Marshalled::Symbol(value.clone()),
      Value::Time(value) => Marshalled::Time(*value),
      Value::List(values) => Marshalled::List(values.iter().map(|value| self.dump(value)).collect()),
      Value::Map(entries) => Marshalled::Map(
        entries
          .iter()
          .map(|(key, value)| (self.dump(key), self.dump(value)))
          .collect(),
      ),
      Value::Object(object) => self.dump_object(object),
      Value::Delayed(delayed) => Marshalled::Object(Box::new(delayed.droby_dump(self))),
      Value::Exception(exception) => Marshalled::Object(Box::new(exception.droby_dump(self))),
      Value::Opaque(opaque) => Marshalled::Opaque(opaque.type_name.clone()),
    }
  }

  fn dump_object(&mut self, object: &PlanObject) -> Marshalled {
    if let Some(remote_id) = self.manager.known_sibling_on(object, &self.remote_peer) {
      return Marshalled::Ref(RemoteRef::new(self.remote_peer.clone(), remote_id));
    }
    // Task events are written through their task, which is tracked instead.
    if is_task_event(object) {
      return Marshalled::Object(Box::new(object.droby_dump(self)));
    }

    let id = object.id();
    let in_group = self
      .dump_context
      .as_ref()
      .is_some_and(|members| members.contains(&id));
    if in_group || !self.in_flight.insert(id) {
      return Marshalled::Id(id);
    }
    let dumped = object.droby_dump(self);
    self.in_flight.remove(&id);
    Marshalled::Object(Box::new(dumped))
  }

  /// Dump groups of objects that may reference each other.
  ///
  /// Every member is written as a full payload exactly once. References to
  /// members, inside the groups or inside `f`, are written as
  /// [`Marshalled::Id`]. The previous dump mode is restored on return,
  /// including on error or panic.
  pub fn dump_groups<R>(
    &mut self,
    groups: &[Vec<PlanObject>],
    f: impl FnOnce(&mut Marshaller) -> Result<R>,
  ) -> Result<(Vec<Vec<Marshalled>>, R)> {
    let mut scope = DumpScope::enter(self, groups.iter().flatten().map(PlanObject::id));

    let mut dumped = Vec::with_capacity(groups.len());
    for group in groups {
      let mut payloads = Vec::with_capacity(group.len());
      for object in group {
        payloads.push(Marshalled::Object(Box::new(object.droby_dump(&mut scope))));
      }
      dumped.push(payloads);
    }

    let result = f(&mut *scope)?;
    Ok((dumped, result))
  }

  // ==========================================================================
  // Load
  // ==========================================================================

  /// Resolve a marshalled value without creating any distributed entity.
  ///
  /// Returns `Ok(None)` when a full payload matches no known object, and for
  /// value-like payloads. References to unknown siblings fail with
  /// [`PlanLogError::UnknownSibling`].
  pub fn find_local_object(&mut self, marshalled: &Marshalled) -> Result<Option<Value>> {
    let value = match marshalled {
      Marshalled::Nil => Value::Nil,
      Marshalled::Bool(value) => Value::Bool(*value),
      Marshalled::Int(value) => Value::Int(*value),
      Marshalled::Float(value) => Value::Float(*value),
      Marshalled::Str(value) => Value::Str(value.clone()),
      Marshalled::Symbol(value) => Value::Symbol(value.clone()),
      Marshalled::Time(value) => Value::Time(*value),
      Marshalled::List(items) => {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
          match self.find_local_object(item)? {
            Some(value) => values.push(value),
            None => return Ok(None),
          }
        }
        Value::List(values)
      }
      Marshalled::Map(entries) => {
        let mut values = Vec::with_capacity(entries.len());
        for (key, value) in entries {
          let (Some(key), Some(value)) = (self.find_local_object(key)?, self.find_local_object(value)?)
          else {
            return Ok(None);
          };
          values.push((key, value));
        }
        Value::Map(values)
      }
      Marshalled::Ref(remote) => Value::Object(self.manager.fetch_by_id(&remote.peer, remote.id)?),
      Marshalled::Id(id) => self.resolve_id(*id)?,
      Marshalled::Object(dumped) => return self.find_dumped(dumped),
      Marshalled::Opaque(type_name) => Value::Opaque(crate::plan::Opaque::new(type_name.clone())),
    };
    Ok(Some(value))
  }

  fn resolve_id(&self, id: ObjectId) -> Result<Value> {
    if let Some(local) = self.load_context.get(&id) {
      return Ok(local.clone());
    }
    self
      .manager
      .fetch_by_id(&self.remote_peer, id)
      .map(Value::Object)
  }

  fn find_dumped(&mut self, dumped: &Dumped) -> Result<Option<Value>> {
    let loadable = dumped.as_load();
    let Some(siblings) = loadable.remote_siblings() else {
      return Ok(None);
    };

    let Some(object) = self.find_registered(siblings) else {
      return Ok(None);
    };
    self.manager.register_siblings(&object, siblings);
    let local = Value::Object(object);
    loadable.update(self, &local, false)?;
    Ok(Some(local))
  }

  fn find_registered(&self, siblings: &Siblings) -> Option<PlanObject> {
    siblings
      .iter()
      .find_map(|(peer, id)| self.manager.find_by_id(peer, *id))
  }

  /// Resolve a marshalled value, building and registering a proxy for full
  /// payloads that match no known object when `create` is set.
  ///
  /// Value-like payloads are rebuilt whenever everything they point to is
  /// already known, whatever `create` says.
  pub fn local_object(&mut self, marshalled: &Marshalled, create: bool) -> Result<Value> {
    match marshalled {
      Marshalled::List(items) => {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
          values.push(self.local_object(item, create)?);
        }
        return Ok(Value::List(values));
      }
      Marshalled::Map(entries) => {
        let mut values = Vec::with_capacity(entries.len());
        for (key, value) in entries {
          values.push((self.local_object(key, create)?, self.local_object(value, create)?));
        }
        return Ok(Value::Map(values));
      }
      _ => {}
    }

    if let Some(local) = self.find_local_object(marshalled)? {
      return Ok(local);
    }

    if let Marshalled::Object(dumped) = marshalled {
      if dumped.remote_siblings().is_none() {
        if let Some(local) = dumped.as_load().resolve_value(self)? {
          return Ok(local);
        }
      }
      if create {
        return self.create_proxy(dumped);
      }
    }
    Err(PlanLogError::NoLocalObject(marshalled.describe()))
  }

  fn create_proxy(&mut self, dumped: &Dumped) -> Result<Value> {
    let loadable = dumped.as_load();
    let proxy = loadable.proxy(self)?;
    if let (Some(siblings), Value::Object(object)) = (loadable.remote_siblings(), &proxy) {
      self.manager.register_object(object, siblings);
    }
    loadable.update(self, &proxy, true)?;
    Ok(proxy)
  }

  /// Resolve a model payload to an existing local model.
  ///
  /// Tries the identity registry, then models registered by name, then the
  /// constant namespace. When a named match is found the payload's siblings
  /// are learnt so later references resolve directly.
  pub fn find_local_model(&mut self, marshalled: &Marshalled) -> Result<Option<Value>> {
    match self.find_local_object(marshalled) {
      Ok(Some(local)) if local.as_model().is_some() => return Ok(Some(local)),
      Ok(_) => {}
      Err(err) if matches!(marshalled, Marshalled::Ref(_) | Marshalled::Id(_)) => return Err(err),
      Err(_) => {}
    }

    let (name, siblings) = match marshalled {
      Marshalled::Object(dumped) => match dumped.as_ref() {
        Dumped::Model(model) => (model.name.as_deref(), Some(&model.remote_siblings)),
        _ => (None, None),
      },
      Marshalled::Str(name) | Marshalled::Symbol(name) => (Some(name.as_str()), None),
      _ => (None, None),
    };
    let Some(name) = name else {
      return Ok(None);
    };

    let found = self
      .manager
      .find_model_by_name(name)
      .or_else(|| self.namespace.resolve(name));
    let Some(model) = found else {
      return Ok(None);
    };
    if let Some(siblings) = siblings {
      self.manager.register_siblings(&model, siblings);
    }
    Ok(Some(Value::Object(model)))
  }

  /// Resolve a model payload, creating and registering a new model when no
  /// local one matches.
  pub fn local_model(&mut self, marshalled: &Marshalled) -> Result<Value> {
    if let Some(model) = self.find_local_model(marshalled)? {
      return Ok(model);
    }
    if !matches!(marshalled, Marshalled::Object(dumped) if matches!(dumped.as_ref(), Dumped::Model(_))) {
      return Err(PlanLogError::NoLocalObject(format!(
        "no local model for {}",
        marshalled.describe()
      )));
    }
    let model = self.local_object(marshalled, true)?;
    if let Value::Object(object) = &model {
      self.manager.register_model(object, None);
    }
    Ok(model)
  }

  /// Load groups of payloads that may reference each other.
  ///
  /// Every member is proxied (or found) first so that references between
  /// members resolve while the payloads are applied. `f` runs while the
  /// group context is active and receives the resolved groups.
  pub fn load_groups<R>(
    &mut self,
    groups: &[Vec<Marshalled>],
    f: impl FnOnce(&mut Marshaller, &[Vec<Value>]) -> Result<R>,
  ) -> Result<(Vec<Vec<Value>>, R)> {
    let mut scope = LoadScope::enter(self);

    let mut resolved: Vec<Vec<Option<Value>>> = Vec::with_capacity(groups.len());
    let mut pending = Vec::new();
    for group in groups {
      let mut slots = Vec::with_capacity(group.len());
      for member in group {
        let Some(dumped) = member.as_dumped() else {
          slots.push(None);
          continue;
        };
        let Some(siblings) = dumped.remote_siblings() else {
          slots.push(None);
          continue;
        };

        let (local, fresh) = match scope.find_registered(siblings) {
          Some(existing) => (Value::Object(existing), false),
          None => (dumped.as_load().proxy(&mut scope)?, true),
        };
        if let Some(id) = siblings.get(&scope.remote_peer) {
          scope.load_context.insert(*id, local.clone());
        }
        pending.push((dumped, local.clone(), fresh));
        slots.push(Some(local));
      }
      resolved.push(slots);
    }

    for (dumped, local, fresh) in &pending {
      let loadable = dumped.as_load();
      if let (Some(siblings), Value::Object(object)) = (loadable.remote_siblings(), local) {
        if *fresh {
          scope.manager.register_object(object, siblings);
        } else {
          scope.manager.register_siblings(object, siblings);
        }
      }
      loadable.update(&mut scope, local, *fresh)?;
    }

    let mut loaded = Vec::with_capacity(groups.len());
    for (group, slots) in groups.iter().zip(resolved) {
      let mut values = Vec::with_capacity(group.len());
      for (member, slot) in group.iter().zip(slots) {
        match slot {
          Some(value) => values.push(value),
          None => values.push(scope.local_object(member, true)?),
        }
      }
      loaded.push(values);
    }

    let result = f(&mut *scope, loaded.as_slice())?;
    Ok((loaded, result))
  }
}

fn is_task_event(object: &PlanObject) -> bool {
  object
    .as_event()
    .is_some_and(|event| event.task().is_some() && event.symbol().is_some())
}

impl std::fmt::Debug for Marshaller {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Marshaller")
      .field("local_peer", self.manager.local_id())
      .field("remote_peer", &self.remote_peer)
      .field("known_objects", &self.manager.len())
      .finish()
  }
}

/// Group dump mode, left when dropped.
struct DumpScope<'a> {
  marshaller: &'a mut Marshaller,
  previous: Option<HashSet<ObjectId>>,
}

impl<'a> DumpScope<'a> {
  fn enter(marshaller: &'a mut Marshaller, members: impl Iterator<Item = ObjectId>) -> Self {
    let previous = marshaller.dump_context.clone();
    let mut context = previous.clone().unwrap_or_default();
    context.extend(members);
    marshaller.dump_context = Some(context);
    Self {
      marshaller,
      previous,
    }
  }
}

impl Deref for DumpScope<'_> {
  type Target = Marshaller;

  fn deref(&self) -> &Marshaller {
    self.marshaller
  }
}

impl DerefMut for DumpScope<'_> {
  fn deref_mut(&mut self) -> &mut Marshaller {
    self.marshaller
  }
}

impl Drop for DumpScope<'_> {
  fn drop(&mut self) {
    self.marshaller.dump_context = self.previous.take();
  }
}

/// Group load mode, left when dropped.
struct LoadScope<'a> {
  marshaller: &'a mut Marshaller,
  previous: HashMap<ObjectId, Value>,
}

impl<'a> LoadScope<'a> {
  fn enter(marshaller: &'a mut Marshaller) -> Self {
    let previous = marshaller.load_context.clone();
    Self {
      marshaller,
      previous,
    }
  }
}

impl Deref for LoadScope<'_> {
  type Target = Marshaller;

  fn deref(&self) -> &Marshaller {
    self.marshaller
  }
}

impl DerefMut for LoadScope<'_> {
  fn deref_mut(&mut self) -> &mut Marshaller {
    self.marshaller
  }
}

impl Drop for LoadScope<'_> {
  fn drop(&mut self) {
    self.marshaller.load_context = std::mem::take(&mut self.previous);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::plan::{EventGenerator, Model, Task};
  use std::sync::Arc;

  fn producer() -> Marshaller {
    let peer = PeerId::new("producer");
    Marshaller::new(ObjectManager::new(peer.clone()), peer)
  }

  fn consumer() -> Marshaller {
    Marshaller::new(
      ObjectManager::new(PeerId::new("consumer")),
      PeerId::new("producer"),
    )
  }

  #[test]
  fn test_plain_values_round_trip() {
    let mut source = producer();
    let mut sink = consumer();
    let value = Value::List(vec![
      Value::Int(42),
      Value::str("text"),
      Value::map([("flag", Value::Bool(true)), ("none", Value::Nil)]),
    ]);

    let dumped = source.dump(&value);
    let loaded = sink.local_object(&dumped, false).expect("plain values load");
    assert_eq!(loaded, value);
  }

  #[test]
  fn test_unregistered_task_dumps_full_payload_then_ref() {
    let mut source = producer();
    let task = Task::new(Model::task("Goto"));
    let object = PlanObject::from(&task);

    let first = source.dump(&Value::from(object.clone()));
    assert!(matches!(first, Marshalled::Object(_)));

    let siblings = first.as_dumped().and_then(Dumped::remote_siblings).cloned();
    source
      .object_manager_mut()
      .register_object(&object, &siblings.unwrap_or_default());
    let second = source.dump(&Value::from(object));
    assert_eq!(
      second,
      Marshalled::Ref(RemoteRef::new(PeerId::new("producer"), task.id()))
    );
  }

  #[test]
  fn test_proxy_is_reused_for_references() {
    let mut source = producer();
    let mut sink = consumer();
    let task = Task::with_arguments(Model::task("Goto"), [("x", Value::Int(3))]);
    let object = PlanObject::from(&task);

    let full = source.dump(&Value::from(object.clone()));
    let proxy = sink.local_object(&full, true).expect("proxy created");
    let proxy_task = proxy.as_task().cloned().expect("proxy is a task");
    assert_ne!(proxy_task.id(), task.id());
    assert_eq!(proxy_task.argument("x"), Some(Value::Int(3)));
    assert_eq!(proxy_task.model().name(), Some("Goto"));

    let reference = Marshalled::Ref(RemoteRef::new(PeerId::new("producer"), task.id()));
    let resolved = sink.local_object(&reference, false).expect("ref resolves");
    assert_eq!(resolved, proxy);

    let again = sink.local_object(&full, true).expect("payload resolves");
    assert_eq!(again, proxy);
  }

  #[test]
  fn test_missing_object_without_create_fails() {
    let mut source = producer();
    let mut sink = consumer();
    let event = EventGenerator::new(Model::event("Tick"), true);
    let full = source.dump(&Value::from(event));

    let err = sink.local_object(&full, false).expect_err("not known yet");
    assert!(matches!(err, PlanLogError::NoLocalObject(_)));

    let unknown = Marshalled::Ref(RemoteRef::new(PeerId::new("producer"), ObjectId::allocate()));
    let err = sink.local_object(&unknown, true).expect_err("unknown sibling");
    assert!(matches!(err, PlanLogError::UnknownSibling { .. }));
  }

  #[test]
  fn test_task_events_resolve_through_their_task() {
    let mut source = producer();
    let mut sink = consumer();
    let task = Task::new(Model::task("Goto"));
    let start = task.event("start").cloned().expect("start event");

    let dumped = source.dump(&Value::from(start));
    let event = sink.local_object(&dumped, true).expect("event proxied");
    let event = event.as_event().cloned().expect("is an event");
    assert_eq!(event.symbol(), Some("start"));
    assert!(event.controlable());
    assert!(event.task().is_some());
  }

  #[test]
  fn test_find_local_model_fallbacks() {
    let mut sink = consumer();
    let base = Model::task("Navigation");
    let goto = Model::submodel(&base, "Navigation::Goto");
    sink.namespace_mut().define(&goto);

    let registered = Model::task("Registered");
    sink
      .object_manager_mut()
      .register_model(&PlanObject::Model(registered.clone()), None);

    let mut source = producer();
    let payload = source.dump(&Value::from(Model::task("Registered")));
    let found = sink.find_local_model(&payload).expect("lookup succeeds");
    assert_eq!(found.and_then(|v| v.as_model().map(|m| m.id())), Some(registered.id()));

    let by_constant = sink
      .find_local_model(&Marshalled::symbol("::Navigation::Goto"))
      .expect("lookup succeeds");
    assert_eq!(by_constant.and_then(|v| v.as_model().map(|m| m.id())), Some(goto.id()));

    let missing = sink
      .find_local_model(&Marshalled::symbol("Unknown"))
      .expect("lookup succeeds");
    assert!(missing.is_none());
  }

  #[test]
  fn test_local_model_creates_submodel_chain() {
    let mut source = producer();
    let mut sink = consumer();
    let base = Model::task("Base");
    let derived = Model::submodel(&base, "Derived");

    let payload = source.dump(&Value::from(derived));
    let model = sink.local_model(&payload).expect("model created");
    let model = model.as_model().cloned().expect("is a model");
    assert_eq!(model.name(), Some("Derived"));
    assert_eq!(
      model.supermodel().and_then(|m| m.name().map(str::to_string)),
      Some("Base".to_string())
    );

    let again = sink.local_model(&payload).expect("model found");
    assert_eq!(again.as_model().map(|m| m.id()), Some(model.id()));
  }

  #[test]
  fn test_group_cycle_round_trip() {
    let mut source = producer();
    let mut sink = consumer();
    let a = Task::new(Model::task("A"));
    let b = Task::new(Model::task("B"));
    a.set_argument("peer", Value::from(b.clone()));
    b.set_argument("peer", Value::from(a.clone()));

    let groups = vec![vec![PlanObject::from(&a)], vec![PlanObject::from(&b)]];
    let (dumped, extra) = source
      .dump_groups(&groups, |m| Ok(m.dump(&Value::from(a.clone()))))
      .expect("dump groups");
    assert!(!source.in_dump_group());
    assert_eq!(extra, Marshalled::Id(a.id()));

    let Some(Dumped::Task(payload_a)) = dumped[0][0].as_dumped() else {
      panic!("expected a task payload");
    };
    assert_eq!(payload_a.arguments[0].1, Marshalled::Id(b.id()));

    let (loaded, peer_of_a) = sink
      .load_groups(&dumped, |m, _| m.local_object(&extra, false))
      .expect("load groups");
    let a2 = loaded[0][0].as_task().cloned().expect("task a");
    let b2 = loaded[1][0].as_task().cloned().expect("task b");
    assert_eq!(peer_of_a.as_task().map(|t| t.id()), Some(a2.id()));
    assert_eq!(a2.argument("peer").and_then(|v| v.as_task().map(|t| t.id())), Some(b2.id()));
    assert_eq!(b2.argument("peer").and_then(|v| v.as_task().map(|t| t.id())), Some(a2.id()));

    a.set_argument("peer", Value::Nil);
    a2.set_argument("peer", Value::Nil);
  }

  #[test]
  fn test_cycle_outside_group_is_cut_and_reloaded() {
    let mut source = producer();
    let mut sink = consumer();
    let a = Task::new(Model::task("A"));
    let b = Task::with_arguments(Model::task("B"), [("peer", Value::from(a.clone()))]);
    a.set_argument("peer", Value::from(b.clone()));
    a.set_argument("start", Value::from(a.event("start").cloned().expect("start event")));

    let dumped = source.dump(&Value::from(a.clone()));
    let Some(Dumped::Task(payload_a)) = dumped.as_dumped() else {
      panic!("expected a task payload");
    };
    let peer = payload_a
      .arguments
      .iter()
      .find(|(key, _)| key == "peer")
      .map(|(_, value)| value)
      .expect("peer argument");
    let Some(Dumped::Task(payload_b)) = peer.as_dumped() else {
      panic!("expected b in full");
    };
    assert_eq!(payload_b.arguments[0].1, Marshalled::Id(a.id()));
    assert!(matches!(
      source.dump(&Value::from(a.clone())),
      Marshalled::Object(_)
    ));

    let loaded = sink.local_object(&dumped, true).expect("cycle loads");
    let a2 = loaded.as_task().cloned().expect("task a");
    let b2 = a2
      .argument("peer")
      .and_then(|v| v.as_task().cloned())
      .expect("task b");
    assert_eq!(b2.argument("peer").and_then(|v| v.as_task().map(|t| t.id())), Some(a2.id()));
    let start2 = a2
      .argument("start")
      .and_then(|v| v.as_event().cloned())
      .expect("start event");
    assert_eq!(start2.task().map(|t| t.id()), Some(a2.id()));

    a.set_argument("peer", Value::Nil);
    a.set_argument("start", Value::Nil);
    a2.set_argument("peer", Value::Nil);
    a2.set_argument("start", Value::Nil);
  }

  #[test]
  fn test_group_mode_restored_after_error() {
    let mut source = producer();
    let task = Task::new(Model::task("A"));
    let groups = vec![vec![PlanObject::from(&task)]];
    let err = source
      .dump_groups(&groups, |_| -> Result<()> {
        Err(PlanLogError::InvalidRecord("boom".to_string()))
      })
      .expect_err("block failed");
    assert!(matches!(err, PlanLogError::InvalidRecord(_)));
    assert!(!source.in_dump_group());
    assert!(matches!(
      source.dump(&Value::from(task)),
      Marshalled::Object(_)
    ));
  }

  #[test]
  fn test_exception_chain_is_rebuilt() {
    let mut source = producer();
    let mut sink = consumer();
    let exception = crate::plan::ExceptionValue::new("CommandFailed", "start failed")
      .caused_by(crate::plan::ExceptionValue::new("Timeout", "no answer"));

    let dumped = source.dump(&Value::from(exception.clone()));
    let loaded = sink.local_object(&dumped, false).expect("exception loads");
    assert_eq!(loaded.as_exception(), Some(&exception));
  }

  #[test]
  fn test_free_event_without_model_is_proxied() {
    let mut sink = consumer();
    let mut siblings = Siblings::new();
    siblings.insert(PeerId::new("producer"), ObjectId::from_raw(7));
    let payload = Marshalled::Object(Box::new(Dumped::Event(super::super::DumpedEvent {
      remote_siblings: siblings,
      model: Marshalled::Nil,
      controlable: false,
      addition_time: None,
    })));
    let event = sink.local_object(&payload, true).expect("event proxied");
    let event: Arc<EventGenerator> = event.as_event().cloned().expect("is an event");
    assert!(event.is_free());
  }
}
