//! Consumer side: rebuilds a mirror plan from log records.

use std::collections::HashMap;
use std::sync::Arc;

use crate::distributed::{Marshalled, Marshaller, ObjectManager};
use crate::error::{PlanLogError, Result};
use crate::logfile::{LogRecord, Reader};
use crate::plan::{
  EdgeChange, Emission, EventCall, EventGenerator, Model, ModelNamespace, Plan, PlanMerge,
  PlanObject, PropagationKind, RelationKind, Task, Value,
};
use crate::types::{ObjectId, PeerId, Timestamp};

use super::records;

#[derive(Debug, Clone)]
pub struct RebuilderOptions {
  local_peer: PeerId,
  remote_peer: Option<PeerId>,
  create_missing_proxies: bool,
  auto_clear_integrated: bool,
  namespace: ModelNamespace,
}

impl Default for RebuilderOptions {
  fn default() -> Self {
    Self {
      local_peer: PeerId::new("replay"),
      remote_peer: None,
      create_missing_proxies: true,
      auto_clear_integrated: false,
      namespace: ModelNamespace::new(),
    }
  }
}

impl RebuilderOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn local_peer(mut self, peer: impl Into<PeerId>) -> Self {
    self.local_peer = peer.into();
    self
  }

  /// Peer the log's objects are known by, instead of the one announced by
  /// `log_session`.
  pub fn remote_peer(mut self, peer: impl Into<PeerId>) -> Self {
    self.remote_peer = Some(peer.into());
    self
  }

  /// Build proxies for objects first seen outside of `merged_plan`
  /// (default: true).
  pub fn create_missing_proxies(mut self, create: bool) -> Self {
    self.create_missing_proxies = create;
    self
  }

  /// Call [`PlanRebuilder::clear_integrated`] before each new cycle.
  pub fn auto_clear_integrated(mut self, clear: bool) -> Self {
    self.auto_clear_integrated = clear;
    self
  }

  /// Statically known models, looked up by name.
  pub fn namespace(mut self, namespace: ModelNamespace) -> Self {
    self.namespace = namespace;
    self
  }
}

/// One event propagation as seen in the mirror plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationRecord {
  pub kind: PropagationKind,
  pub sources: Vec<ObjectId>,
  pub target: ObjectId,
  pub propagation_id: u64,
  pub time: Timestamp,
  sequence: u64,
}

/// A record that could not be applied.
#[derive(Debug)]
pub struct RecordFailure {
  pub name: String,
  pub error: PlanLogError,
}

#[derive(Debug, Default)]
pub struct CycleReport {
  pub processed: usize,
  pub ignored: usize,
  pub failures: Vec<RecordFailure>,
}

impl CycleReport {
  pub fn is_clean(&self) -> bool {
    self.failures.is_empty()
  }
}

pub struct PlanRebuilder {
  marshaller: Marshaller,
  plan: Plan,
  remote_peer_fixed: bool,
  create_missing_proxies: bool,
  auto_clear_integrated: bool,
  cycle_info: Option<Value>,
  cycle_count: u64,
  propagations: Vec<PropagationRecord>,
  first_emission: HashMap<ObjectId, u64>,
  sequence: u64,
}

impl PlanRebuilder {
  pub fn new(options: RebuilderOptions) -> Self {
    let remote_peer_fixed = options.remote_peer.is_some();
    let remote_peer = options
      .remote_peer
      .unwrap_or_else(|| PeerId::new("remote"));
    let marshaller = Marshaller::new(ObjectManager::new(options.local_peer), remote_peer)
      .with_namespace(options.namespace);
    Self {
      marshaller,
      plan: Plan::new(),
      remote_peer_fixed,
      create_missing_proxies: options.create_missing_proxies,
      auto_clear_integrated: options.auto_clear_integrated,
      cycle_info: None,
      cycle_count: 0,
      propagations: Vec::new(),
      first_emission: HashMap::new(),
      sequence: 0,
    }
  }

  pub fn plan(&self) -> &Plan {
    &self.plan
  }

  pub fn plan_mut(&mut self) -> &mut Plan {
    &mut self.plan
  }

  pub fn marshaller(&self) -> &Marshaller {
    &self.marshaller
  }

  pub fn marshaller_mut(&mut self) -> &mut Marshaller {
    &mut self.marshaller
  }

  pub fn object_manager(&self) -> &ObjectManager<PlanObject> {
    self.marshaller.object_manager()
  }

  /// Make a local model resolvable by name.
  pub fn register_model(&mut self, model: &Arc<Model>) {
    self
      .marshaller
      .object_manager_mut()
      .register_model(&PlanObject::Model(model.clone()), None);
  }

  pub fn remote_peer(&self) -> &PeerId {
    self.marshaller.remote_peer()
  }

  /// Info map of the last `cycle_end` record.
  pub fn cycle_info(&self) -> Option<&Value> {
    self.cycle_info.as_ref()
  }

  pub fn cycle_count(&self) -> u64 {
    self.cycle_count
  }

  pub fn garbaged_tasks(&self) -> Vec<Arc<Task>> {
    self.plan.garbaged_tasks()
  }

  pub fn garbaged_events(&self) -> Vec<Arc<EventGenerator>> {
    self.plan.garbaged_events()
  }

  pub fn propagations(&self) -> &[PropagationRecord] {
    &self.propagations
  }

  /// Replay every remaining cycle of `reader`.
  pub fn process_log(&mut self, reader: &mut Reader) -> Result<Vec<CycleReport>> {
    let mut reports = Vec::new();
    while let Some(cycle) = reader.load_one_cycle()? {
      reports.push(self.process_cycle(&cycle)?);
    }
    Ok(reports)
  }

  /// Apply the records of one cycle in order.
  ///
  /// Records that reference unknown objects or are malformed are reported in
  /// the returned [`CycleReport`] and skipped. Structural file errors and I/O
  /// errors abort.
  pub fn process_cycle(&mut self, cycle: &[LogRecord]) -> Result<CycleReport> {
    if self.auto_clear_integrated {
      self.clear_integrated();
    }

    let mut report = CycleReport::default();
    for record in cycle {
      match self.process_record(record) {
        Ok(true) => report.processed += 1,
        Ok(false) => report.ignored += 1,
        Err(err) if err.is_identity() || matches!(err, PlanLogError::InvalidRecord(_)) => {
          tracing::warn!(record = %record.name, "cannot replay record: {err}");
          report.failures.push(RecordFailure {
            name: record.name.clone(),
            error: err,
          });
        }
        Err(err) if err.is_structural() => {
          tracing::error!(record = %record.name, "replay stopped on a malformed log: {err}");
          return Err(err);
        }
        Err(err) => return Err(err),
      }
    }
    Ok(report)
  }

  /// Apply one record. Returns false if the record name is unknown.
  pub fn process_record(&mut self, record: &LogRecord) -> Result<bool> {
    self.sequence += 1;
    match record.name.as_str() {
      records::LOG_SESSION => self.log_session(record)?,
      records::MERGED_PLAN => self.merged_plan(record)?,
      records::FINALIZED_TASK | records::FINALIZED_EVENT => self.finalized(record)?,
      records::GARBAGE_TASK | records::GARBAGE_EVENT => {
        let object = self.object_arg(record, 0)?;
        self.plan.mark_garbage(&object)?;
      }
      records::ADDED_EDGE => {
        let (relation, parent, child) = self.edge_args(record)?;
        let info = self.value_arg(record, 3)?;
        self.plan.add_edge(relation, &parent, &child, info)?;
      }
      records::UPDATED_EDGE_INFO => {
        let (relation, parent, child) = self.edge_args(record)?;
        let info = self.value_arg(record, 3)?;
        self.plan.update_edge_info(relation, &parent, &child, info)?;
      }
      records::REMOVED_EDGE => {
        let (relation, parent, child) = self.edge_args(record)?;
        self.plan.remove_edge(relation, &parent, &child)?;
      }
      records::ADDED_MISSION | records::UNMARKED_MISSION => {
        let object = self.object_arg(record, 0)?;
        self.plan.set_mission(&object, record.name == records::ADDED_MISSION)?;
      }
      records::ADDED_PERMANENT | records::UNMARKED_PERMANENT => {
        let object = self.object_arg(record, 0)?;
        self.plan.set_permanent(&object, record.name == records::ADDED_PERMANENT)?;
      }
      records::TASK_ARGUMENTS_UPDATED => {
        let task = self.task_arg(record, 0)?;
        let key = str_arg(record, 1)?.to_string();
        let value = self.value_arg(record, 2)?;
        self.plan.set_task_argument(&task, &key, value)?;
      }
      records::TASK_FAILED_TO_START => {
        let task = self.task_arg(record, 0)?;
        let reason = self.value_arg(record, 1)?;
        self.plan.fail_to_start(&task, reason)?;
      }
      records::GENERATOR_CALLED => {
        let event = self.event_arg(record, 0)?;
        let context = self.value_arg(record, 1)?;
        self.plan.record_call(
          &event,
          EventCall {
            time: record.time,
            context,
          },
        )?;
      }
      records::GENERATOR_FIRED => self.generator_fired(record)?,
      records::GENERATOR_EMIT_FAILED => {
        let event = self.event_arg(record, 0)?;
        let error = self.value_arg(record, 1)?;
        self.plan.emit_failed(&event, error)?;
      }
      records::GENERATOR_PROPAGATE_EVENTS => self.propagate(record)?,
      records::CYCLE_END => {
        self.cycle_info = Some(self.value_arg(record, 0)?);
        self.cycle_count += 1;
      }
      other => {
        tracing::debug!(record = %other, "ignoring unknown log record");
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Remove the objects the source plan collected and forget them.
  pub fn clear_integrated(&mut self) -> Vec<PlanObject> {
    let swept = self.plan.clear_integrated();
    let manager = self.marshaller.object_manager_mut();
    for object in &swept {
      manager.deregister_object(object);
    }
    swept
  }

  /// Check that every source of every propagation was emitted before it.
  pub fn verify_causal_order(&self) -> Result<()> {
    for propagation in &self.propagations {
      for source in &propagation.sources {
        match self.first_emission.get(source) {
          Some(emitted) if *emitted < propagation.sequence => {}
          _ => {
            return Err(PlanLogError::InvalidRecord(format!(
              "{} propagation {} to {} from {source} happened before the source was emitted",
              propagation.kind, propagation.propagation_id, propagation.target
            )));
          }
        }
      }
    }
    Ok(())
  }

  // ==========================================================================
  // Record handlers
  // ==========================================================================

  fn log_session(&mut self, record: &LogRecord) -> Result<()> {
    if self.remote_peer_fixed {
      return Ok(());
    }
    let peer = PeerId::new(str_arg(record, 0)?);
    tracing::debug!(peer = %peer, "replaying log session");
    self.marshaller.set_remote_peer(peer);
    Ok(())
  }

  fn merged_plan(&mut self, record: &LogRecord) -> Result<()> {
    let tasks = list_arg(record, 0)?.to_vec();
    let events = list_arg(record, 1)?.to_vec();
    let edges = list_arg(record, 2)?;

    let (loaded, edges) = self.marshaller.load_groups(&[tasks, events], |m, _| {
      let mut changes = Vec::with_capacity(edges.len());
      for edge in edges {
        let fields = edge.as_list().ok_or_else(|| {
          PlanLogError::InvalidRecord(format!("merged_plan edge is not a list: {}", edge.describe()))
        })?;
        let [parent, child, relation, info] = fields else {
          return Err(PlanLogError::InvalidRecord(format!(
            "merged_plan edge has {} fields instead of 4",
            fields.len()
          )));
        };
        changes.push(EdgeChange {
          relation: relation_of(relation)?,
          parent: object_of(m.local_object(parent, true)?, parent)?,
          child: object_of(m.local_object(child, true)?, child)?,
          info: m.local_object(info, true)?,
        });
      }
      Ok(changes)
    })?;

    let mut merge = PlanMerge {
      edges,
      ..PlanMerge::default()
    };
    let mut groups = loaded.into_iter();
    for value in groups.next().unwrap_or_default() {
      let task = value.as_task().cloned().ok_or_else(|| {
        PlanLogError::InvalidRecord(format!("merged_plan task is {value}"))
      })?;
      merge.tasks.push(task);
    }
    for value in groups.next().unwrap_or_default() {
      let event = value.as_event().cloned().ok_or_else(|| {
        PlanLogError::InvalidRecord(format!("merged_plan event is {value}"))
      })?;
      merge.events.push(event);
    }
    self.plan.merge(merge)
  }

  fn finalized(&mut self, record: &LogRecord) -> Result<()> {
    let object = self.object_arg(record, 0)?;
    if self.plan.is_garbage(object.id()) {
      // Kept until clear_integrated.
      return Ok(());
    }
    match &object {
      PlanObject::Task(task) => {
        self.plan.remove_task(task)?;
      }
      PlanObject::Event(event) => {
        self.plan.remove_free_event(event)?;
      }
      PlanObject::Model(_) => {
        return Err(PlanLogError::InvalidRecord(format!(
          "{} on a model",
          record.name
        )))
      }
    }
    self.marshaller.object_manager_mut().deregister_object(&object);
    Ok(())
  }

  fn generator_fired(&mut self, record: &LogRecord) -> Result<()> {
    let event = self.event_arg(record, 0)?;
    let emission = Emission {
      id: u64_arg(record, 1)?,
      time: record.arg(2)?.as_time().ok_or_else(|| invalid_arg(record, 2, "a time"))?,
      context: self.value_arg(record, 3)?,
      propagation_id: u64_arg(record, 4)?,
    };
    self.first_emission.entry(event.id()).or_insert(self.sequence);
    self.plan.record_emission(&event, emission)
  }

  fn propagate(&mut self, record: &LogRecord) -> Result<()> {
    let kind: PropagationKind = str_arg(record, 0)?.parse()?;
    let mut sources = Vec::new();
    for source in list_arg(record, 1)? {
      sources.push(self.event_of(source)?);
    }
    let target = self.event_arg(record, 2)?;
    let propagation_id = u64_arg(record, 3)?;

    self.propagations.push(PropagationRecord {
      kind,
      sources: sources.iter().map(|source| source.id()).collect(),
      target: target.id(),
      propagation_id,
      time: record.time,
      sequence: self.sequence,
    });
    self.plan.propagate(kind, &sources, &target, propagation_id)
  }

  // ==========================================================================
  // Argument decoding
  // ==========================================================================

  fn value_arg(&mut self, record: &LogRecord, idx: usize) -> Result<Value> {
    let create = self.create_missing_proxies;
    self.marshaller.local_object(record.arg(idx)?, create)
  }

  fn object_arg(&mut self, record: &LogRecord, idx: usize) -> Result<PlanObject> {
    let value = self.value_arg(record, idx)?;
    object_of(value, record.arg(idx)?)
  }

  fn task_arg(&mut self, record: &LogRecord, idx: usize) -> Result<Arc<Task>> {
    match self.object_arg(record, idx)? {
      PlanObject::Task(task) => Ok(task),
      _ => Err(invalid_arg(record, idx, "a task")),
    }
  }

  fn event_arg(&mut self, record: &LogRecord, idx: usize) -> Result<Arc<EventGenerator>> {
    self.event_of(record.arg(idx)?)
  }

  fn event_of(&mut self, marshalled: &Marshalled) -> Result<Arc<EventGenerator>> {
    let create = self.create_missing_proxies;
    let value = self.marshaller.local_object(marshalled, create)?;
    value.as_event().cloned().ok_or_else(|| {
      PlanLogError::InvalidRecord(format!("expected an event, got {}", marshalled.describe()))
    })
  }

  fn edge_args(&mut self, record: &LogRecord) -> Result<(RelationKind, PlanObject, PlanObject)> {
    let relation = relation_of(record.arg(2)?)?;
    let parent = self.object_arg(record, 0)?;
    let child = self.object_arg(record, 1)?;
    Ok((relation, parent, child))
  }
}

impl std::fmt::Debug for PlanRebuilder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PlanRebuilder")
      .field("marshaller", &self.marshaller)
      .field("tasks", &self.plan.task_count())
      .field("free_events", &self.plan.free_event_count())
      .field("cycle_count", &self.cycle_count)
      .finish()
  }
}

fn invalid_arg(record: &LogRecord, idx: usize, expected: &str) -> PlanLogError {
  let got = record
    .args
    .get(idx)
    .map(Marshalled::describe)
    .unwrap_or_else(|| "nothing".to_string());
  PlanLogError::InvalidRecord(format!(
    "argument {idx} of {} should be {expected}, got {got}",
    record.name
  ))
}

fn str_arg(record: &LogRecord, idx: usize) -> Result<&str> {
  record
    .arg(idx)?
    .as_str()
    .ok_or_else(|| invalid_arg(record, idx, "a string"))
}

fn u64_arg(record: &LogRecord, idx: usize) -> Result<u64> {
  record
    .arg(idx)?
    .as_int()
    .and_then(|value| u64::try_from(value).ok())
    .ok_or_else(|| invalid_arg(record, idx, "a non-negative integer"))
}

fn list_arg(record: &LogRecord, idx: usize) -> Result<&[Marshalled]> {
  record
    .arg(idx)?
    .as_list()
    .ok_or_else(|| invalid_arg(record, idx, "a list"))
}

fn relation_of(marshalled: &Marshalled) -> Result<RelationKind> {
  marshalled
    .as_str()
    .ok_or_else(|| {
      PlanLogError::InvalidRecord(format!("relation should be a symbol, got {}", marshalled.describe()))
    })?
    .parse()
}

fn object_of(value: Value, marshalled: &Marshalled) -> Result<PlanObject> {
  match value {
    Value::Object(object) => Ok(object),
    _ => Err(PlanLogError::InvalidRecord(format!(
      "expected a plan object, got {}",
      marshalled.describe()
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::distributed::{Dumped, DumpedTask};
  use crate::types::Siblings;

  fn task_payload(peer: &str, raw_id: u64, model: &str) -> Marshalled {
    let mut siblings = Siblings::new();
    siblings.insert(PeerId::new(peer), ObjectId::from_raw(raw_id));
    let mut model_siblings = Siblings::new();
    model_siblings.insert(PeerId::new(peer), ObjectId::from_raw(raw_id + 1000));
    Marshalled::Object(Box::new(Dumped::Task(DumpedTask {
      remote_siblings: siblings,
      model: Marshalled::Object(Box::new(Dumped::Model(crate::distributed::DumpedModel {
        remote_siblings: model_siblings,
        name: Some(model.to_string()),
        kind: crate::plan::ModelKind::Task,
        supermodel: None,
      }))),
      arguments: Vec::new(),
      addition_time: Some(Timestamp::new(50, 123_456)),
    })))
  }

  fn record(name: &str, args: Vec<Marshalled>) -> LogRecord {
    LogRecord::new(name, Timestamp::new(50, 0), args)
  }

  #[test]
  fn test_session_peer_is_adopted() {
    let mut rebuilder = PlanRebuilder::new(RebuilderOptions::new());
    rebuilder
      .process_record(&record(records::LOG_SESSION, vec![Marshalled::Str("robot".into())]))
      .expect("log_session");
    assert_eq!(rebuilder.remote_peer(), &PeerId::new("robot"));

    let mut fixed = PlanRebuilder::new(RebuilderOptions::new().remote_peer("other"));
    fixed
      .process_record(&record(records::LOG_SESSION, vec![Marshalled::Str("robot".into())]))
      .expect("log_session");
    assert_eq!(fixed.remote_peer(), &PeerId::new("other"));
  }

  #[test]
  fn test_unknown_records_are_ignored() {
    let mut rebuilder = PlanRebuilder::new(RebuilderOptions::new());
    let report = rebuilder
      .process_cycle(&[record("exception_notification", Vec::new())])
      .expect("cycle");
    assert_eq!(report.ignored, 1);
    assert!(report.is_clean());
  }

  #[test]
  fn test_unknown_reference_is_reported_not_fatal() {
    let mut rebuilder = PlanRebuilder::new(RebuilderOptions::new().remote_peer("robot"));
    let stale = Marshalled::Ref(crate::types::RemoteRef::new(
      PeerId::new("robot"),
      ObjectId::from_raw(99),
    ));
    let cycle = vec![
      record(records::FINALIZED_TASK, vec![stale]),
      record(
        records::MERGED_PLAN,
        vec![
          Marshalled::List(vec![task_payload("robot", 1, "Goto")]),
          Marshalled::List(Vec::new()),
          Marshalled::List(Vec::new()),
        ],
      ),
    ];
    let report = rebuilder.process_cycle(&cycle).expect("cycle");
    assert_eq!(report.processed, 1);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
      report.failures[0].error,
      PlanLogError::UnknownSibling { .. }
    ));
    assert_eq!(rebuilder.plan().task_count(), 1);
    let tasks = rebuilder.plan().tasks();
    assert_eq!(tasks[0].addition_time(), Some(Timestamp::new(50, 123_456)));
  }

  #[test]
  fn test_causal_order_violation_is_detected() {
    let mut rebuilder = PlanRebuilder::new(RebuilderOptions::new().remote_peer("robot"));
    let event = crate::plan::EventGenerator::new(Model::event("Tick"), true);
    let target = crate::plan::EventGenerator::new(Model::event("Tock"), true);
    rebuilder.plan_mut().add_free_event(&event).expect("add event");
    rebuilder.plan_mut().add_free_event(&target).expect("add target");
    let mut siblings = Siblings::new();
    siblings.insert(PeerId::new("robot"), ObjectId::from_raw(1));
    rebuilder
      .marshaller_mut()
      .object_manager_mut()
      .register_object(&PlanObject::from(&event), &siblings);
    let mut target_siblings = Siblings::new();
    target_siblings.insert(PeerId::new("robot"), ObjectId::from_raw(2));
    rebuilder
      .marshaller_mut()
      .object_manager_mut()
      .register_object(&PlanObject::from(&target), &target_siblings);

    let source_ref =
      Marshalled::Ref(crate::types::RemoteRef::new(PeerId::new("robot"), ObjectId::from_raw(1)));
    let target_ref =
      Marshalled::Ref(crate::types::RemoteRef::new(PeerId::new("robot"), ObjectId::from_raw(2)));
    rebuilder
      .process_record(&record(
        records::GENERATOR_PROPAGATE_EVENTS,
        vec![
          Marshalled::symbol("signal"),
          Marshalled::List(vec![source_ref.clone()]),
          target_ref,
          Marshalled::Int(1),
        ],
      ))
      .expect("propagation");
    assert!(rebuilder.verify_causal_order().is_err());
  }
}
