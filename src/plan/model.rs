//! Task and event models.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::ObjectId;

use super::PlanObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
  Task,
  Event,
}

impl ModelKind {
  pub fn as_u8(self) -> u8 {
    match self {
      ModelKind::Task => 0,
      ModelKind::Event => 1,
    }
  }

  pub fn from_u8(raw: u8) -> Option<Self> {
    match raw {
      0 => Some(ModelKind::Task),
      1 => Some(ModelKind::Event),
      _ => None,
    }
  }
}

/// A named task or event model.
///
/// Models without a name are anonymous: they can only be referenced by
/// identity.
#[derive(Debug)]
pub struct Model {
  id: ObjectId,
  name: Option<String>,
  kind: ModelKind,
  supermodel: Option<Arc<Model>>,
}

impl Model {
  pub fn new(name: Option<&str>, kind: ModelKind, supermodel: Option<Arc<Model>>) -> Arc<Self> {
    Arc::new(Self {
      id: ObjectId::allocate(),
      name: name.map(str::to_string),
      kind,
      supermodel,
    })
  }

  pub fn task(name: &str) -> Arc<Self> {
    Self::new(Some(name), ModelKind::Task, None)
  }

  pub fn event(name: &str) -> Arc<Self> {
    Self::new(Some(name), ModelKind::Event, None)
  }

  /// A named submodel of `parent`.
  pub fn submodel(parent: &Arc<Model>, name: &str) -> Arc<Self> {
    Self::new(Some(name), parent.kind, Some(parent.clone()))
  }

  pub fn id(&self) -> ObjectId {
    self.id
  }

  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  pub fn kind(&self) -> ModelKind {
    self.kind
  }

  pub fn supermodel(&self) -> Option<&Arc<Model>> {
    self.supermodel.as_ref()
  }

  /// True if `self` is `other` or one of its submodels.
  pub fn fullfills(&self, other: &Model) -> bool {
    if self.id == other.id {
      return true;
    }
    if let (Some(mine), Some(theirs)) = (self.name.as_deref(), other.name.as_deref()) {
      if mine == theirs {
        return true;
      }
    }
    self
      .supermodel
      .as_ref()
      .is_some_and(|parent| parent.fullfills(other))
  }
}

/// Statically known models, resolved by constant path.
#[derive(Debug, Clone, Default)]
pub struct ModelNamespace {
  constants: HashMap<String, PlanObject>,
}

impl ModelNamespace {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn define(&mut self, model: &Arc<Model>) {
    if let Some(name) = model.name() {
      self
        .constants
        .insert(normalize_path(name).to_string(), PlanObject::Model(model.clone()));
    }
  }

  pub fn with(mut self, model: &Arc<Model>) -> Self {
    self.define(model);
    self
  }

  pub fn resolve(&self, path: &str) -> Option<PlanObject> {
    self.constants.get(normalize_path(path)).cloned()
  }
}

fn normalize_path(path: &str) -> &str {
  path.trim_start_matches("::")
}
