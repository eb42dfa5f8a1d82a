//! Plan structure: tasks, free events, relation graphs and flags.
//!
//! The plan does bookkeeping only. Every mutation is reported to the
//! registered observers, which is how a live plan gets logged; a mirror plan
//! built by the replay engine usually has no observers.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{PlanLogError, Result};
use crate::types::{ObjectId, Timestamp};

use super::{
  DelayedArgument, EdgeChange, Emission, EventCall, EventGenerator, PlanMerge, PlanObject,
  PlanObserver, PropagationKind, RelationGraph, RelationKind, Task, Value,
};

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct PlanFlags: u8 {
    const MISSION = 0b0001;
    const PERMANENT = 0b0010;
    /// Collected by the source plan, kept until `clear_integrated`
    const GARBAGE = 0b0100;
  }
}

#[derive(Debug, Clone)]
struct PlanEntry<T> {
  object: Arc<T>,
  flags: PlanFlags,
}

pub type SharedObserver = Arc<Mutex<dyn PlanObserver>>;

#[derive(Default)]
pub struct Plan {
  tasks: IndexMap<ObjectId, PlanEntry<Task>>,
  free_events: IndexMap<ObjectId, PlanEntry<EventGenerator>>,
  relations: BTreeMap<RelationKind, RelationGraph>,
  observers: Vec<SharedObserver>,
  next_emission_id: u64,
}

/// Changes staged against a plan and applied at once by [`Plan::commit`].
///
/// Observers only see the committed result, as if the changes had been made
/// on the plan directly.
#[derive(Debug, Default)]
pub struct Transaction {
  merge: PlanMerge,
  missions: Vec<PlanObject>,
  permanents: Vec<PlanObject>,
}

impl Transaction {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_task(&mut self, task: &Arc<Task>) -> &mut Self {
    self.merge.tasks.push(task.clone());
    self
  }

  pub fn add_mission_task(&mut self, task: &Arc<Task>) -> &mut Self {
    self.add_task(task);
    self.missions.push(PlanObject::Task(task.clone()));
    self
  }

  pub fn add_permanent_task(&mut self, task: &Arc<Task>) -> &mut Self {
    self.add_task(task);
    self.permanents.push(PlanObject::Task(task.clone()));
    self
  }

  pub fn add_free_event(&mut self, event: &Arc<EventGenerator>) -> &mut Self {
    self.merge.events.push(event.clone());
    self
  }

  pub fn add_permanent_event(&mut self, event: &Arc<EventGenerator>) -> &mut Self {
    self.add_free_event(event);
    self.permanents.push(PlanObject::Event(event.clone()));
    self
  }

  pub fn add_edge(
    &mut self,
    relation: RelationKind,
    parent: impl Into<PlanObject>,
    child: impl Into<PlanObject>,
    info: Value,
  ) -> &mut Self {
    self.merge.edges.push(EdgeChange {
      relation,
      parent: parent.into(),
      child: child.into(),
      info,
    });
    self
  }
}

impl Plan {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_observer(&mut self, observer: SharedObserver) {
    self.observers.push(observer);
  }

  fn notify(&self, mut f: impl FnMut(&mut dyn PlanObserver) -> Result<()>) -> Result<()> {
    for observer in &self.observers {
      let mut observer = observer.lock();
      f(&mut *observer)?;
    }
    Ok(())
  }

  // ========================================================================
  // Structure
  // ========================================================================

  pub fn add_task(&mut self, task: &Arc<Task>) -> Result<()> {
    self.merge(PlanMerge {
      tasks: vec![task.clone()],
      ..PlanMerge::default()
    })
  }

  pub fn add_mission_task(&mut self, task: &Arc<Task>) -> Result<()> {
    self.add_task(task)?;
    self.set_mission(&PlanObject::Task(task.clone()), true)
  }

  pub fn add_permanent_task(&mut self, task: &Arc<Task>) -> Result<()> {
    self.add_task(task)?;
    self.set_permanent(&PlanObject::Task(task.clone()), true)
  }

  pub fn add_free_event(&mut self, event: &Arc<EventGenerator>) -> Result<()> {
    self.merge(PlanMerge {
      events: vec![event.clone()],
      ..PlanMerge::default()
    })
  }

  pub fn add_permanent_event(&mut self, event: &Arc<EventGenerator>) -> Result<()> {
    self.add_free_event(event)?;
    self.set_permanent(&PlanObject::Event(event.clone()), true)
  }

  /// Add objects and edges in one step.
  ///
  /// Objects with no addition time get the current wall-clock time; objects
  /// already in the plan are left alone. Edges that already exist get their
  /// info merged.
  pub fn merge(&mut self, merge: PlanMerge) -> Result<()> {
    let now = Timestamp::now();
    let mut applied = PlanMerge::default();

    for task in merge.tasks {
      if self.tasks.contains_key(&task.id()) {
        continue;
      }
      if task.addition_time().is_none() {
        task.set_addition_time(Some(now));
      }
      self.tasks.insert(
        task.id(),
        PlanEntry {
          object: task.clone(),
          flags: PlanFlags::empty(),
        },
      );
      applied.tasks.push(task);
    }

    for event in merge.events {
      if !event.is_free() {
        return Err(PlanLogError::InvalidRecord(format!(
          "event {} belongs to a task and cannot be added as a free event",
          event.id()
        )));
      }
      if self.free_events.contains_key(&event.id()) {
        continue;
      }
      if event.addition_time().is_none() {
        event.set_addition_time(Some(now));
      }
      self.free_events.insert(
        event.id(),
        PlanEntry {
          object: event.clone(),
          flags: PlanFlags::empty(),
        },
      );
      applied.events.push(event);
    }

    for mut edge in merge.edges {
      let graph = self.relations.entry(edge.relation).or_default();
      let parent = edge.parent.id();
      let child = edge.child.id();
      if let Some(existing) = graph.edge_info(parent, child) {
        edge.info = edge.relation.merge_info(existing, &edge.info);
      }
      graph.insert(parent, child, edge.info.clone());
      applied.edges.push(edge);
    }

    if applied.is_empty() {
      return Ok(());
    }
    self.notify(|observer| observer.merged_plan(&applied))
  }

  /// Stage changes in `f` and commit them.
  pub fn in_transaction(&mut self, f: impl FnOnce(&mut Transaction)) -> Result<()> {
    let mut transaction = Transaction::new();
    f(&mut transaction);
    self.commit(transaction)
  }

  pub fn commit(&mut self, transaction: Transaction) -> Result<()> {
    self.merge(transaction.merge)?;
    for object in &transaction.missions {
      self.set_mission(object, true)?;
    }
    for object in &transaction.permanents {
      self.set_permanent(object, true)?;
    }
    Ok(())
  }

  pub fn add_edge(
    &mut self,
    relation: RelationKind,
    parent: &PlanObject,
    child: &PlanObject,
    info: Value,
  ) -> Result<()> {
    let graph = self.relations.entry(relation).or_default();
    let existing = graph.edge_info(parent.id(), child.id()).cloned();
    let info = match &existing {
      Some(existing) => relation.merge_info(existing, &info),
      None => info,
    };
    graph.insert(parent.id(), child.id(), info.clone());

    let edge = EdgeChange {
      relation,
      parent: parent.clone(),
      child: child.clone(),
      info,
    };
    if existing.is_some() {
      self.notify(|observer| observer.updated_edge_info(&edge))
    } else {
      self.notify(|observer| observer.added_edge(&edge))
    }
  }

  /// Replace the info of an existing edge.
  pub fn update_edge_info(
    &mut self,
    relation: RelationKind,
    parent: &PlanObject,
    child: &PlanObject,
    info: Value,
  ) -> Result<()> {
    let graph = self.relations.entry(relation).or_default();
    if !graph.has_edge(parent.id(), child.id()) {
      return Err(PlanLogError::InvalidRecord(format!(
        "no {relation} edge between {parent} and {child}"
      )));
    }
    graph.insert(parent.id(), child.id(), info.clone());

    let edge = EdgeChange {
      relation,
      parent: parent.clone(),
      child: child.clone(),
      info,
    };
    self.notify(|observer| observer.updated_edge_info(&edge))
  }

  /// Returns false if the edge did not exist.
  pub fn remove_edge(
    &mut self,
    relation: RelationKind,
    parent: &PlanObject,
    child: &PlanObject,
  ) -> Result<bool> {
    let removed = self
      .relations
      .get_mut(&relation)
      .and_then(|graph| graph.remove(parent.id(), child.id()))
      .is_some();
    if removed {
      self.notify(|observer| observer.removed_edge(relation, parent, child))?;
    }
    Ok(removed)
  }

  // ========================================================================
  // Flags
  // ========================================================================

  fn flags_mut(&mut self, object: &PlanObject) -> Result<&mut PlanFlags> {
    let flags = match object {
      PlanObject::Task(task) => self.tasks.get_mut(&task.id()).map(|entry| &mut entry.flags),
      PlanObject::Event(event) => self
        .free_events
        .get_mut(&event.id())
        .map(|entry| &mut entry.flags),
      PlanObject::Model(_) => None,
    };
    flags.ok_or_else(|| {
      PlanLogError::InvalidRecord(format!("{object} is not a task or free event of this plan"))
    })
  }

  fn flags(&self, id: ObjectId) -> PlanFlags {
    self
      .tasks
      .get(&id)
      .map(|entry| entry.flags)
      .or_else(|| self.free_events.get(&id).map(|entry| entry.flags))
      .unwrap_or_default()
  }

  pub fn set_mission(&mut self, object: &PlanObject, mission: bool) -> Result<()> {
    let flags = self.flags_mut(object)?;
    if flags.contains(PlanFlags::MISSION) == mission {
      return Ok(());
    }
    flags.set(PlanFlags::MISSION, mission);
    self.notify(|observer| observer.mission_changed(object, mission))
  }

  pub fn set_permanent(&mut self, object: &PlanObject, permanent: bool) -> Result<()> {
    let flags = self.flags_mut(object)?;
    if flags.contains(PlanFlags::PERMANENT) == permanent {
      return Ok(());
    }
    flags.set(PlanFlags::PERMANENT, permanent);
    self.notify(|observer| observer.permanent_changed(object, permanent))
  }

  pub fn is_mission(&self, id: ObjectId) -> bool {
    self.flags(id).contains(PlanFlags::MISSION)
  }

  pub fn is_permanent(&self, id: ObjectId) -> bool {
    self.flags(id).contains(PlanFlags::PERMANENT)
  }

  pub fn is_garbage(&self, id: ObjectId) -> bool {
    self.flags(id).contains(PlanFlags::GARBAGE)
  }

  // ========================================================================
  // Arguments
  // ========================================================================

  pub fn set_task_argument(&mut self, task: &Arc<Task>, key: &str, value: Value) -> Result<()> {
    task.set_argument(key, value.clone());
    self.notify(|observer| observer.task_arguments_updated(task, key, &value))
  }

  /// Replace delayed arguments `resolve` has a value for.
  ///
  /// Returns the number of arguments frozen.
  pub fn freeze_delayed_arguments(
    &mut self,
    task: &Arc<Task>,
    mut resolve: impl FnMut(&str, &DelayedArgument) -> Option<Value>,
  ) -> Result<usize> {
    let mut frozen = 0;
    for (key, value) in task.arguments() {
      let Value::Delayed(delayed) = value else {
        continue;
      };
      if let Some(resolved) = resolve(&key, &delayed) {
        self.set_task_argument(task, &key, resolved)?;
        frozen += 1;
      }
    }
    Ok(frozen)
  }

  // ========================================================================
  // Runtime events
  // ========================================================================

  pub fn call(&mut self, event: &Arc<EventGenerator>, context: Value) -> Result<()> {
    event.record_call(EventCall {
      time: Timestamp::now(),
      context: context.clone(),
    });
    self.notify(|observer| observer.generator_called(event, &context))
  }

  /// Replay a call recorded elsewhere.
  pub fn record_call(&mut self, event: &Arc<EventGenerator>, call: EventCall) -> Result<()> {
    event.record_call(call.clone());
    self.notify(|observer| observer.generator_called(event, &call.context))
  }

  pub fn emit(
    &mut self,
    event: &Arc<EventGenerator>,
    context: Value,
    propagation_id: u64,
  ) -> Result<Emission> {
    self.next_emission_id += 1;
    let emission = Emission {
      id: self.next_emission_id,
      time: Timestamp::now(),
      context,
      propagation_id,
    };
    event.record_emission(emission.clone());
    self.notify(|observer| observer.generator_fired(event, &emission))?;
    Ok(emission)
  }

  /// Replay an emission recorded elsewhere.
  pub fn record_emission(&mut self, event: &Arc<EventGenerator>, emission: Emission) -> Result<()> {
    self.next_emission_id = self.next_emission_id.max(emission.id);
    event.record_emission(emission.clone());
    self.notify(|observer| observer.generator_fired(event, &emission))
  }

  pub fn emit_failed(&mut self, event: &Arc<EventGenerator>, error: Value) -> Result<()> {
    event.record_emit_failure(error.clone());
    self.notify(|observer| observer.generator_emit_failed(event, &error))
  }

  pub fn propagate(
    &mut self,
    kind: PropagationKind,
    sources: &[Arc<EventGenerator>],
    target: &Arc<EventGenerator>,
    propagation_id: u64,
  ) -> Result<()> {
    self.notify(|observer| {
      observer.generator_propagate_events(kind, sources, target, propagation_id)
    })
  }

  pub fn fail_to_start(&mut self, task: &Arc<Task>, reason: Value) -> Result<()> {
    task.set_failure_reason(reason.clone());
    self.notify(|observer| observer.task_failed_to_start(task, &reason))
  }

  // ========================================================================
  // Removal
  // ========================================================================

  fn detach(&mut self, object: &PlanObject) -> bool {
    let (removed, mut vertices) = match object {
      PlanObject::Task(task) => (
        self.tasks.shift_remove(&task.id()).is_some(),
        task.events().map(|event| event.id()).collect::<Vec<_>>(),
      ),
      PlanObject::Event(event) => (self.free_events.shift_remove(&event.id()).is_some(), Vec::new()),
      PlanObject::Model(_) => (false, Vec::new()),
    };
    if removed {
      vertices.push(object.id());
      for graph in self.relations.values_mut() {
        graph.remove_vertices(&vertices);
      }
    }
    removed
  }

  /// Remove a task directly. Returns false if it was not in the plan.
  pub fn remove_task(&mut self, task: &Arc<Task>) -> Result<bool> {
    if !self.detach(&PlanObject::Task(task.clone())) {
      return Ok(false);
    }
    self.notify(|observer| observer.finalized_task(task))?;
    Ok(true)
  }

  pub fn remove_free_event(&mut self, event: &Arc<EventGenerator>) -> Result<bool> {
    if !self.detach(&PlanObject::Event(event.clone())) {
      return Ok(false);
    }
    self.notify(|observer| observer.finalized_event(event))?;
    Ok(true)
  }

  /// Flag an object as collected without removing it.
  pub fn mark_garbage(&mut self, object: &PlanObject) -> Result<()> {
    let flags = self.flags_mut(object)?;
    if flags.contains(PlanFlags::GARBAGE) {
      return Ok(());
    }
    flags.insert(PlanFlags::GARBAGE);
    match object {
      PlanObject::Task(task) => self.notify(|observer| observer.garbage_task(task)),
      PlanObject::Event(event) => self.notify(|observer| observer.garbage_event(event)),
      PlanObject::Model(_) => Ok(()),
    }
  }

  /// Collect an object: flag it as garbage, then remove it.
  pub fn garbage_collect(&mut self, object: &PlanObject) -> Result<()> {
    self.mark_garbage(object)?;
    match object {
      PlanObject::Task(task) => self.remove_task(task).map(|_| ()),
      PlanObject::Event(event) => self.remove_free_event(event).map(|_| ()),
      PlanObject::Model(_) => Ok(()),
    }
  }

  /// Remove every object flagged as garbage and return them.
  pub fn clear_integrated(&mut self) -> Vec<PlanObject> {
    let mut swept: Vec<PlanObject> = self
      .tasks
      .values()
      .filter(|entry| entry.flags.contains(PlanFlags::GARBAGE))
      .map(|entry| PlanObject::Task(entry.object.clone()))
      .collect();
    swept.extend(
      self
        .free_events
        .values()
        .filter(|entry| entry.flags.contains(PlanFlags::GARBAGE))
        .map(|entry| PlanObject::Event(entry.object.clone())),
    );
    for object in &swept {
      self.detach(object);
    }
    swept
  }

  // ========================================================================
  // Queries
  // ========================================================================

  pub fn tasks(&self) -> Vec<Arc<Task>> {
    self.tasks.values().map(|entry| entry.object.clone()).collect()
  }

  pub fn free_events(&self) -> Vec<Arc<EventGenerator>> {
    self
      .free_events
      .values()
      .map(|entry| entry.object.clone())
      .collect()
  }

  pub fn task(&self, id: ObjectId) -> Option<&Arc<Task>> {
    self.tasks.get(&id).map(|entry| &entry.object)
  }

  pub fn free_event(&self, id: ObjectId) -> Option<&Arc<EventGenerator>> {
    self.free_events.get(&id).map(|entry| &entry.object)
  }

  pub fn has_task(&self, id: ObjectId) -> bool {
    self.tasks.contains_key(&id)
  }

  pub fn has_free_event(&self, id: ObjectId) -> bool {
    self.free_events.contains_key(&id)
  }

  pub fn task_count(&self) -> usize {
    self.tasks.len()
  }

  pub fn free_event_count(&self) -> usize {
    self.free_events.len()
  }

  pub fn missions(&self) -> Vec<Arc<Task>> {
    self.tasks_with(PlanFlags::MISSION)
  }

  pub fn permanent_tasks(&self) -> Vec<Arc<Task>> {
    self.tasks_with(PlanFlags::PERMANENT)
  }

  pub fn permanent_events(&self) -> Vec<Arc<EventGenerator>> {
    self.events_with(PlanFlags::PERMANENT)
  }

  pub fn garbaged_tasks(&self) -> Vec<Arc<Task>> {
    self.tasks_with(PlanFlags::GARBAGE)
  }

  pub fn garbaged_events(&self) -> Vec<Arc<EventGenerator>> {
    self.events_with(PlanFlags::GARBAGE)
  }

  fn tasks_with(&self, flag: PlanFlags) -> Vec<Arc<Task>> {
    self
      .tasks
      .values()
      .filter(|entry| entry.flags.contains(flag))
      .map(|entry| entry.object.clone())
      .collect()
  }

  fn events_with(&self, flag: PlanFlags) -> Vec<Arc<EventGenerator>> {
    self
      .free_events
      .values()
      .filter(|entry| entry.flags.contains(flag))
      .map(|entry| entry.object.clone())
      .collect()
  }

  pub fn relation(&self, relation: RelationKind) -> Option<&RelationGraph> {
    self.relations.get(&relation)
  }

  pub fn has_edge(&self, relation: RelationKind, parent: ObjectId, child: ObjectId) -> bool {
    self
      .relations
      .get(&relation)
      .is_some_and(|graph| graph.has_edge(parent, child))
  }

  pub fn edge_info(&self, relation: RelationKind, parent: ObjectId, child: ObjectId) -> Option<&Value> {
    self
      .relations
      .get(&relation)
      .and_then(|graph| graph.edge_info(parent, child))
  }

  pub fn edge_count(&self, relation: RelationKind) -> usize {
    self.relations.get(&relation).map_or(0, RelationGraph::len)
  }
}

#[cfg(test)]
mod tests {
  use super::Plan;
  use crate::error::Result;
  use crate::plan::{
    EdgeChange, Model, PlanMerge, PlanObject, PlanObserver, RelationKind, Task, Value,
  };
  use parking_lot::Mutex;
  use std::sync::Arc;

  #[derive(Default)]
  struct Journal {
    entries: Vec<String>,
  }

  impl PlanObserver for Journal {
    fn merged_plan(&mut self, merge: &PlanMerge) -> Result<()> {
      self.entries.push(format!(
        "merged {} {} {}",
        merge.tasks.len(),
        merge.events.len(),
        merge.edges.len()
      ));
      Ok(())
    }

    fn updated_edge_info(&mut self, edge: &EdgeChange) -> Result<()> {
      self.entries.push(format!("updated {}", edge.relation));
      Ok(())
    }

    fn mission_changed(&mut self, _object: &PlanObject, mission: bool) -> Result<()> {
      self.entries.push(format!("mission {mission}"));
      Ok(())
    }

    fn garbage_task(&mut self, _task: &Arc<Task>) -> Result<()> {
      self.entries.push("garbage".to_string());
      Ok(())
    }

    fn finalized_task(&mut self, _task: &Arc<Task>) -> Result<()> {
      self.entries.push("finalized".to_string());
      Ok(())
    }
  }

  fn observed_plan() -> (Plan, Arc<Mutex<Journal>>) {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let mut plan = Plan::new();
    plan.add_observer(journal.clone());
    (plan, journal)
  }

  #[test]
  fn transaction_commit_matches_direct_changes() {
    let model = Model::task("Roby::Task");
    let (mut direct, direct_journal) = observed_plan();
    let task = Task::new(model.clone());
    direct.add_mission_task(&task).expect("add");

    let (mut staged, staged_journal) = observed_plan();
    let task = Task::new(model);
    staged
      .in_transaction(|trsc| {
        trsc.add_mission_task(&task);
      })
      .expect("commit");

    assert_eq!(direct_journal.lock().entries, staged_journal.lock().entries);
    assert_eq!(staged.missions().len(), 1);
  }

  #[test]
  fn adding_an_existing_edge_merges_info() {
    let model = Model::task("Roby::Task");
    let (mut plan, journal) = observed_plan();
    let parent = Task::new(model.clone());
    let child = Task::new(model);
    plan.add_task(&parent).expect("parent");
    plan.add_task(&child).expect("child");

    let parent_obj = PlanObject::Task(parent.clone());
    let child_obj = PlanObject::Task(child.clone());
    let info = |name: &str| Value::map([("model", Value::List(vec![Value::str(name)]))]);
    plan
      .add_edge(RelationKind::Dependency, &parent_obj, &child_obj, info("A"))
      .expect("edge");
    plan
      .add_edge(RelationKind::Dependency, &parent_obj, &child_obj, info("B"))
      .expect("edge again");

    let stored = plan
      .edge_info(RelationKind::Dependency, parent.id(), child.id())
      .expect("info");
    assert_eq!(
      stored.get("model"),
      Some(&Value::List(vec![Value::str("A"), Value::str("B")]))
    );
    assert_eq!(journal.lock().entries.last().map(String::as_str), Some("updated dependency"));
  }

  #[test]
  fn garbage_collection_notifies_then_removes() {
    let (mut plan, journal) = observed_plan();
    let task = Task::new(Model::task("Roby::Task"));
    plan.add_task(&task).expect("add");
    plan
      .garbage_collect(&PlanObject::Task(task.clone()))
      .expect("gc");

    assert!(!plan.has_task(task.id()));
    let entries = journal.lock().entries.clone();
    assert_eq!(&entries[entries.len() - 2..], &["garbage", "finalized"]);
  }

  #[test]
  fn removing_a_task_drops_edges_of_its_events() {
    let model = Model::task("Roby::Task");
    let mut plan = Plan::new();
    let a = Task::new(model.clone());
    let b = Task::new(model);
    plan.add_task(&a).expect("a");
    plan.add_task(&b).expect("b");
    let a_start = PlanObject::Event(a.event("start").expect("start").clone());
    let b_start = PlanObject::Event(b.event("start").expect("start").clone());
    plan
      .add_edge(RelationKind::Signal, &a_start, &b_start, Value::Nil)
      .expect("signal");

    plan.remove_task(&b).expect("remove");
    assert_eq!(plan.edge_count(RelationKind::Signal), 0);
  }
}
