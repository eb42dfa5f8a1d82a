//! Identity registry mapping local objects to the ids peers know them by.

use std::collections::HashMap;

use crate::error::{PlanLogError, Result};
use crate::types::{ObjectId, PeerId, RemoteRef, Siblings};

/// Objects that can be tracked by an [`ObjectManager`].
pub trait Identifiable {
  /// Local identity of the object.
  fn droby_id(&self) -> ObjectId;

  /// Name the object resolves by when it is a model.
  fn model_name(&self) -> Option<String> {
    None
  }
}

#[derive(Debug, Clone)]
struct Entry<O> {
  object: O,
  siblings: Siblings,
}

/// Per-session registry of object siblings.
///
/// An object is known iff it has at least one sibling. Registration always
/// adds the self entry `local_id -> object.droby_id()`.
#[derive(Debug, Clone)]
pub struct ObjectManager<O> {
  local_id: PeerId,
  siblings: HashMap<ObjectId, Entry<O>>,
  reverse: HashMap<RemoteRef, ObjectId>,
  models_by_name: HashMap<String, O>,
}

impl<O: Identifiable + Clone> ObjectManager<O> {
  pub fn new(local_id: PeerId) -> Self {
    Self {
      local_id,
      siblings: HashMap::new(),
      reverse: HashMap::new(),
      models_by_name: HashMap::new(),
    }
  }

  pub fn local_id(&self) -> &PeerId {
    &self.local_id
  }

  /// Forget every object and model.
  pub fn clear(&mut self) {
    self.siblings.clear();
    self.reverse.clear();
    self.models_by_name.clear();
  }

  pub fn len(&self) -> usize {
    self.siblings.len()
  }

  pub fn is_empty(&self) -> bool {
    self.siblings.is_empty()
  }

  pub fn include(&self, object: &O) -> bool {
    self.siblings.contains_key(&object.droby_id())
  }

  /// Register `object`, merging `siblings` and its self entry.
  pub fn register_object(&mut self, object: &O, siblings: &Siblings) {
    let mut all = siblings.clone();
    all.insert(self.local_id.clone(), object.droby_id());
    self.register_siblings(object, &all);
  }

  /// Remove every sibling of `object`.
  pub fn deregister_object(&mut self, object: &O) {
    if let Some(entry) = self.siblings.remove(&object.droby_id()) {
      for (peer, id) in entry.siblings {
        self.reverse.remove(&RemoteRef::new(peer, id));
      }
    }
    self
      .models_by_name
      .retain(|_, model| model.droby_id() != object.droby_id());
  }

  pub fn register_siblings(&mut self, object: &O, siblings: &Siblings) {
    let key = object.droby_id();
    let entry = self.siblings.entry(key).or_insert_with(|| Entry {
      object: object.clone(),
      siblings: Siblings::new(),
    });

    for (peer, id) in siblings {
      let remote = RemoteRef::new(peer.clone(), *id);
      if let Some(previous) = entry.siblings.insert(peer.clone(), *id) {
        if previous != *id {
          self.reverse.remove(&RemoteRef::new(peer.clone(), previous));
        }
      }
      self.reverse.insert(remote, key);
    }
  }

  /// Remove the given siblings of `object`.
  ///
  /// Every `(peer, id)` pair must match a registered sibling exactly; a
  /// mismatch means the sibling bookkeeping diverged from the protocol
  /// stream and nothing is removed.
  pub fn deregister_siblings(&mut self, object: &O, siblings: &Siblings) -> Result<()> {
    let key = object.droby_id();
    let entry = self.siblings.get(&key).ok_or_else(|| {
      PlanLogError::RegistryConsistency(format!("object {key} has no registered siblings"))
    })?;

    for (peer, id) in siblings {
      match entry.siblings.get(peer) {
        Some(registered) if registered == id => {}
        Some(registered) => {
          return Err(PlanLogError::RegistryConsistency(format!(
            "object {key} is known as {registered} on {peer}, not {id}"
          )));
        }
        None => {
          return Err(PlanLogError::RegistryConsistency(format!(
            "object {key} has no sibling on {peer} (expected {id})"
          )));
        }
      }
    }

    let mut now_empty = false;
    if let Some(entry) = self.siblings.get_mut(&key) {
      for (peer, id) in siblings {
        entry.siblings.remove(peer);
        self.reverse.remove(&RemoteRef::new(peer.clone(), *id));
      }
      now_empty = entry.siblings.is_empty();
    }
    if now_empty {
      self.siblings.remove(&key);
    }
    Ok(())
  }

  pub fn siblings_of(&self, object: &O) -> Option<&Siblings> {
    self
      .siblings
      .get(&object.droby_id())
      .map(|entry| &entry.siblings)
  }

  /// Id under which `peer` knows `object`.
  pub fn known_sibling_on(&self, object: &O, peer: &PeerId) -> Option<ObjectId> {
    self
      .siblings_of(object)
      .and_then(|siblings| siblings.get(peer).copied())
  }

  pub fn find_by_id(&self, peer: &PeerId, id: ObjectId) -> Option<O> {
    let key = self.reverse.get(&RemoteRef::new(peer.clone(), id))?;
    self.siblings.get(key).map(|entry| entry.object.clone())
  }

  pub fn fetch_by_id(&self, peer: &PeerId, id: ObjectId) -> Result<O> {
    self
      .find_by_id(peer, id)
      .ok_or_else(|| PlanLogError::UnknownSibling {
        peer: peer.clone(),
        id,
      })
  }

  /// Register `model` for identity and, when it has a name, by name.
  ///
  /// An explicit `name` wins over the model's own name.
  pub fn register_model(&mut self, model: &O, name: Option<&str>) {
    self.register_object(model, &Siblings::new());
    let name = name.map(str::to_string).or_else(|| model.model_name());
    if let Some(name) = name {
      self.models_by_name.insert(name, model.clone());
    }
  }

  pub fn find_model_by_name(&self, name: &str) -> Option<O> {
    self.models_by_name.get(name).cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::{Identifiable, ObjectManager};
  use crate::error::PlanLogError;
  use crate::types::{ObjectId, PeerId, Siblings};

  #[derive(Debug, Clone, PartialEq)]
  struct Entity {
    id: ObjectId,
    name: Option<String>,
  }

  impl Entity {
    fn new(name: Option<&str>) -> Self {
      Self {
        id: ObjectId::allocate(),
        name: name.map(str::to_string),
      }
    }
  }

  impl Identifiable for Entity {
    fn droby_id(&self) -> ObjectId {
      self.id
    }

    fn model_name(&self) -> Option<String> {
      self.name.clone()
    }
  }

  fn siblings(entries: &[(&str, u64)]) -> Siblings {
    entries
      .iter()
      .map(|(peer, id)| (PeerId::new(*peer), ObjectId::from_raw(*id)))
      .collect()
  }

  #[test]
  fn register_then_fetch_by_remote_id() {
    let mut manager = ObjectManager::new(PeerId::new("local"));
    let entity = Entity::new(None);
    manager.register_object(&entity, &siblings(&[("remote", 42)]));

    let found = manager
      .fetch_by_id(&PeerId::new("remote"), ObjectId::from_raw(42))
      .expect("fetch");
    assert_eq!(found, entity);
    assert_eq!(
      manager.find_by_id(&PeerId::new("local"), entity.id),
      Some(entity.clone())
    );
  }

  #[test]
  fn registration_is_additive_and_idempotent() {
    let mut manager = ObjectManager::new(PeerId::new("local"));
    let entity = Entity::new(None);
    manager.register_object(&entity, &siblings(&[("a", 1)]));
    manager.register_object(&entity, &siblings(&[("a", 1)]));
    manager.register_object(&entity, &siblings(&[("b", 2)]));

    let known = manager.siblings_of(&entity).expect("siblings");
    assert_eq!(known.len(), 3);
    assert_eq!(manager.len(), 1);
  }

  #[test]
  fn removing_last_sibling_forgets_object() {
    let mut manager = ObjectManager::new(PeerId::new("local"));
    let entity = Entity::new(None);
    manager.register_siblings(&entity, &siblings(&[("remote", 7)]));
    assert!(manager.include(&entity));

    manager
      .deregister_siblings(&entity, &siblings(&[("remote", 7)]))
      .expect("deregister");
    assert!(!manager.include(&entity));
    assert!(manager
      .find_by_id(&PeerId::new("remote"), ObjectId::from_raw(7))
      .is_none());
  }

  #[test]
  fn mismatched_deregistration_fails_without_mutation() {
    let mut manager = ObjectManager::new(PeerId::new("local"));
    let entity = Entity::new(None);
    manager.register_object(&entity, &siblings(&[("remote", 7)]));

    let err = manager
      .deregister_siblings(&entity, &siblings(&[("remote", 8)]))
      .expect_err("wrong id must fail");
    assert!(matches!(err, PlanLogError::RegistryConsistency(_)));
    assert!(manager
      .find_by_id(&PeerId::new("remote"), ObjectId::from_raw(7))
      .is_some());
  }

  #[test]
  fn fetch_unknown_sibling_fails() {
    let manager: ObjectManager<Entity> = ObjectManager::new(PeerId::new("local"));
    let err = manager
      .fetch_by_id(&PeerId::new("remote"), ObjectId::from_raw(1))
      .expect_err("unknown");
    assert!(matches!(err, PlanLogError::UnknownSibling { .. }));
  }

  #[test]
  fn models_resolve_by_explicit_or_own_name() {
    let mut manager = ObjectManager::new(PeerId::new("local"));
    let named = Entity::new(Some("Nav::Goto"));
    let renamed = Entity::new(Some("Ignored"));
    let anonymous = Entity::new(None);

    manager.register_model(&named, None);
    manager.register_model(&renamed, Some("Explicit"));
    manager.register_model(&anonymous, None);

    assert_eq!(manager.find_model_by_name("Nav::Goto"), Some(named));
    assert_eq!(manager.find_model_by_name("Explicit"), Some(renamed));
    assert!(manager.find_model_by_name("Ignored").is_none());
    assert!(manager.include(&anonymous));
  }

  #[test]
  fn deregister_object_clears_reverse_entries() {
    let mut manager = ObjectManager::new(PeerId::new("local"));
    let entity = Entity::new(Some("M"));
    manager.register_model(&entity, None);
    manager.register_siblings(&entity, &siblings(&[("remote", 3)]));
    manager.deregister_object(&entity);

    assert!(manager.is_empty());
    assert!(manager.find_model_by_name("M").is_none());
    assert!(manager
      .find_by_id(&PeerId::new("remote"), ObjectId::from_raw(3))
      .is_none());
  }
}
