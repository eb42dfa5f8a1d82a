//! Typed relation graphs between plan objects.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;

use crate::error::PlanLogError;
use crate::types::ObjectId;

use super::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationKind {
  // Task relations
  Dependency,
  PlannedBy,
  ErrorHandling,
  // Event relations
  Signal,
  Forwarding,
  CausalLink,
  Precedence,
}

impl RelationKind {
  pub const ALL: [RelationKind; 7] = [
    RelationKind::Dependency,
    RelationKind::PlannedBy,
    RelationKind::ErrorHandling,
    RelationKind::Signal,
    RelationKind::Forwarding,
    RelationKind::CausalLink,
    RelationKind::Precedence,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      RelationKind::Dependency => "dependency",
      RelationKind::PlannedBy => "planned_by",
      RelationKind::ErrorHandling => "error_handling",
      RelationKind::Signal => "signal",
      RelationKind::Forwarding => "forwarding",
      RelationKind::CausalLink => "causal_link",
      RelationKind::Precedence => "precedence",
    }
  }

  /// True for relations between tasks, false for relations between events.
  pub fn is_task_relation(self) -> bool {
    matches!(
      self,
      RelationKind::Dependency | RelationKind::PlannedBy | RelationKind::ErrorHandling
    )
  }

  /// Info of an edge added twice.
  ///
  /// Dependency edges accumulate their `model` and `roles` lists; other
  /// relations keep the latest info.
  pub fn merge_info(self, existing: &Value, added: &Value) -> Value {
    match (self, existing, added) {
      (RelationKind::Dependency, Value::Map(old), Value::Map(new)) => {
        let mut merged = old.clone();
        for (key, value) in new {
          let accumulates = matches!(key.as_str(), Some("model") | Some("roles"));
          match merged.iter_mut().find(|(candidate, _)| candidate == key) {
            Some((_, current)) if accumulates => {
              *current = union_lists(current, value);
            }
            Some((_, current)) => *current = value.clone(),
            None => merged.push((key.clone(), value.clone())),
          }
        }
        Value::Map(merged)
      }
      _ => added.clone(),
    }
  }
}

fn union_lists(existing: &Value, added: &Value) -> Value {
  let mut items = match existing {
    Value::List(items) => items.clone(),
    Value::Nil => Vec::new(),
    other => vec![other.clone()],
  };
  let added = match added {
    Value::List(values) => values.clone(),
    Value::Nil => Vec::new(),
    other => vec![other.clone()],
  };
  for value in added {
    if !items.contains(&value) {
      items.push(value);
    }
  }
  Value::List(items)
}

impl fmt::Display for RelationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RelationKind {
  type Err = PlanLogError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    RelationKind::ALL
      .iter()
      .copied()
      .find(|kind| kind.as_str() == raw)
      .ok_or_else(|| PlanLogError::InvalidRecord(format!("unknown relation: {raw}")))
  }
}

/// Edges of one relation, keyed by `(parent, child)` object ids.
#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
  edges: IndexMap<(ObjectId, ObjectId), Value>,
}

impl RelationGraph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.edges.len()
  }

  pub fn is_empty(&self) -> bool {
    self.edges.is_empty()
  }

  pub fn has_edge(&self, parent: ObjectId, child: ObjectId) -> bool {
    self.edges.contains_key(&(parent, child))
  }

  pub fn edge_info(&self, parent: ObjectId, child: ObjectId) -> Option<&Value> {
    self.edges.get(&(parent, child))
  }

  /// Returns the previous info if the edge already existed.
  pub fn insert(&mut self, parent: ObjectId, child: ObjectId, info: Value) -> Option<Value> {
    self.edges.insert((parent, child), info)
  }

  pub fn remove(&mut self, parent: ObjectId, child: ObjectId) -> Option<Value> {
    self.edges.shift_remove(&(parent, child))
  }

  /// Drop every edge touching one of `vertices`.
  pub fn remove_vertices(&mut self, vertices: &[ObjectId]) {
    self
      .edges
      .retain(|(parent, child), _| !vertices.contains(parent) && !vertices.contains(child));
  }

  pub fn children_of(&self, parent: ObjectId) -> Vec<ObjectId> {
    self
      .edges
      .keys()
      .filter(|(from, _)| *from == parent)
      .map(|(_, to)| *to)
      .collect()
  }

  pub fn parents_of(&self, child: ObjectId) -> Vec<ObjectId> {
    self
      .edges
      .keys()
      .filter(|(_, to)| *to == child)
      .map(|(from, _)| *from)
      .collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = (ObjectId, ObjectId, &Value)> {
    self
      .edges
      .iter()
      .map(|((parent, child), info)| (*parent, *child, info))
  }
}

#[cfg(test)]
mod tests {
  use super::RelationKind;
  use crate::plan::Value;
  use std::str::FromStr;

  #[test]
  fn dependency_merge_accumulates_models() {
    let first = Value::map([
      ("model", Value::List(vec![Value::str("Nav::Goto")])),
      ("success", Value::symbol("success")),
    ]);
    let second = Value::map([
      ("model", Value::List(vec![Value::str("Nav::Move")])),
      ("success", Value::symbol("stop")),
    ]);
    let merged = RelationKind::Dependency.merge_info(&first, &second);

    assert_eq!(
      merged.get("model"),
      Some(&Value::List(vec![Value::str("Nav::Goto"), Value::str("Nav::Move")]))
    );
    assert_eq!(merged.get("success"), Some(&Value::symbol("stop")));
  }

  #[test]
  fn other_relations_replace_info() {
    let merged = RelationKind::Signal.merge_info(&Value::Int(1), &Value::Int(2));
    assert_eq!(merged, Value::Int(2));
  }

  #[test]
  fn relation_names_roundtrip() {
    for kind in RelationKind::ALL {
      assert_eq!(RelationKind::from_str(kind.as_str()).expect("parse"), kind);
    }
    assert!(RelationKind::from_str("hierarchy").is_err());
  }
}
