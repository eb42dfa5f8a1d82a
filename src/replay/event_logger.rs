//! Producer side: turns plan notifications into log records.

use std::path::Path;
use std::sync::Arc;

use crate::constants::{CYCLE_END, CYCLE_INFO_END, CYCLE_INFO_INDEX, CYCLE_INFO_START, FORMAT_VERSION};
use crate::distributed::{Marshalled, Marshaller, ObjectManager};
use crate::error::Result;
use crate::logfile::{LogRecord, Writer, WriterOptions};
use crate::plan::{
  EdgeChange, Emission, EventGenerator, PlanMerge, PlanObject, PlanObserver, PropagationKind,
  RelationKind, Task, Value,
};
use crate::types::{PeerId, Siblings, Timestamp};

use super::records;

#[derive(Debug, Clone)]
pub struct EventLoggerOptions {
  peer: PeerId,
  plugins: Vec<String>,
  version: u32,
  sync_each_cycle: bool,
}

impl Default for EventLoggerOptions {
  fn default() -> Self {
    Self {
      peer: PeerId::new("local"),
      plugins: Vec::new(),
      version: FORMAT_VERSION,
      sync_each_cycle: false,
    }
  }
}

impl EventLoggerOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Peer id the logged objects are known by.
  pub fn peer(mut self, peer: impl Into<PeerId>) -> Self {
    self.peer = peer.into();
    self
  }

  pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
    self.plugins.push(plugin.into());
    self
  }

  pub fn version(mut self, version: u32) -> Self {
    self.version = version;
    self
  }

  /// Flush the file after every cycle.
  pub fn sync_each_cycle(mut self, sync: bool) -> Self {
    self.sync_each_cycle = sync;
    self
  }
}

/// Records plan changes and writes them as one chunk per execution cycle.
///
/// Register it on a [`crate::plan::Plan`] with
/// [`crate::plan::Plan::add_observer`]. The first record of a log is always
/// `log_session`, naming the peer objects are known by.
pub struct EventLogger {
  marshaller: Marshaller,
  writer: Writer,
  current_cycle: Vec<LogRecord>,
  cycle_index: u64,
  sync_each_cycle: bool,
}

impl EventLogger {
  pub fn open(path: impl AsRef<Path>, options: EventLoggerOptions) -> Result<Self> {
    let writer = Writer::open(
      path,
      WriterOptions::new()
        .plugins(options.plugins.clone())
        .version(options.version),
    )?;
    Self::with_writer(writer, options)
  }

  pub fn with_writer(writer: Writer, options: EventLoggerOptions) -> Result<Self> {
    let peer = options.peer.clone();
    let marshaller = Marshaller::new(ObjectManager::new(peer.clone()), peer.clone());
    let mut logger = Self {
      marshaller,
      writer,
      current_cycle: Vec::new(),
      cycle_index: 0,
      sync_each_cycle: options.sync_each_cycle,
    };
    logger.record(records::LOG_SESSION, vec![Marshalled::Str(peer.as_str().to_string())])?;
    Ok(logger)
  }

  pub fn peer(&self) -> &PeerId {
    self.marshaller.local_peer()
  }

  pub fn marshaller(&self) -> &Marshaller {
    &self.marshaller
  }

  /// Number of cycles written so far.
  pub fn cycle_count(&self) -> u64 {
    self.cycle_index
  }

  /// Records buffered for the current cycle.
  pub fn pending(&self) -> &[LogRecord] {
    &self.current_cycle
  }

  /// Buffer a record. A `cycle_end` record closes the cycle and writes it.
  pub fn dump(&mut self, name: &str, time: Timestamp, args: Vec<Marshalled>) -> Result<()> {
    self.current_cycle.push(LogRecord::new(name, time, args));
    if name == CYCLE_END {
      self.write_cycle()?;
    }
    Ok(())
  }

  fn record(&mut self, name: &str, args: Vec<Marshalled>) -> Result<()> {
    self.dump(name, Timestamp::now(), args)
  }

  fn write_cycle(&mut self) -> Result<()> {
    if self.current_cycle.is_empty() {
      return Ok(());
    }
    let cycle = std::mem::take(&mut self.current_cycle);
    self.writer.dump(&cycle)?;
    self.cycle_index += 1;
    if self.sync_each_cycle {
      self.writer.flush()?;
    }
    Ok(())
  }

  /// Standard `cycle_end` info for a cycle that ran from `start` to `end`.
  pub fn cycle_info(&self, start: Timestamp, end: Timestamp) -> Value {
    Value::map([
      (CYCLE_INFO_START, Value::Time(start)),
      (CYCLE_INFO_END, Value::Int(end.micros_since(start) as i64)),
      (CYCLE_INFO_INDEX, Value::Int(self.cycle_index as i64)),
    ])
  }

  /// Close the current cycle with `info` and write it.
  pub fn cycle_end(&mut self, info: &Value) -> Result<()> {
    let info = self.marshaller.dump(info);
    self.record(CYCLE_END, vec![info])
  }

  /// Write buffered records, even without a `cycle_end`, and flush the file.
  pub fn flush(&mut self) -> Result<()> {
    self.write_cycle()?;
    self.writer.flush()
  }

  pub fn close(mut self) -> Result<()> {
    self.write_cycle()?;
    self.writer.close()
  }

  fn dump_object(&mut self, object: impl Into<PlanObject>) -> Marshalled {
    self.marshaller.dump(&Value::Object(object.into()))
  }

  fn forget(&mut self, object: &PlanObject) {
    self.marshaller.object_manager_mut().deregister_object(object);
  }

  fn dump_edge(&mut self, edge: &EdgeChange) -> Vec<Marshalled> {
    vec![
      self.dump_object(edge.parent.clone()),
      self.dump_object(edge.child.clone()),
      Marshalled::symbol(edge.relation.as_str()),
      self.marshaller.dump(&edge.info),
    ]
  }
}

impl std::fmt::Debug for EventLogger {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventLogger")
      .field("peer", self.peer())
      .field("writer", &self.writer)
      .field("cycle_index", &self.cycle_index)
      .field("pending", &self.current_cycle.len())
      .finish()
  }
}

impl PlanObserver for EventLogger {
  fn merged_plan(&mut self, merge: &PlanMerge) -> Result<()> {
    let groups = vec![
      merge.tasks.iter().map(PlanObject::from).collect::<Vec<_>>(),
      merge.events.iter().map(PlanObject::from).collect::<Vec<_>>(),
    ];
    let (dumped, edges) = self.marshaller.dump_groups(&groups, |m| {
      let edges = merge
        .edges
        .iter()
        .map(|edge| {
          Marshalled::List(vec![
            m.dump(&Value::Object(edge.parent.clone())),
            m.dump(&Value::Object(edge.child.clone())),
            Marshalled::symbol(edge.relation.as_str()),
            m.dump(&edge.info),
          ])
        })
        .collect();
      Ok(Marshalled::List(edges))
    })?;

    let mut args: Vec<Marshalled> = dumped.into_iter().map(Marshalled::List).collect();
    args.push(edges);
    self.record(records::MERGED_PLAN, args)?;

    // Later references to these objects are written as refs.
    let manager = self.marshaller.object_manager_mut();
    for object in groups.iter().flatten() {
      manager.register_object(object, &Siblings::new());
    }
    Ok(())
  }

  fn finalized_task(&mut self, task: &Arc<Task>) -> Result<()> {
    let arg = self.dump_object(task);
    self.record(records::FINALIZED_TASK, vec![arg])?;
    self.forget(&PlanObject::from(task));
    Ok(())
  }

  fn finalized_event(&mut self, event: &Arc<EventGenerator>) -> Result<()> {
    let arg = self.dump_object(event);
    self.record(records::FINALIZED_EVENT, vec![arg])?;
    self.forget(&PlanObject::from(event));
    Ok(())
  }

  fn garbage_task(&mut self, task: &Arc<Task>) -> Result<()> {
    let arg = self.dump_object(task);
    self.record(records::GARBAGE_TASK, vec![arg])
  }

  fn garbage_event(&mut self, event: &Arc<EventGenerator>) -> Result<()> {
    let arg = self.dump_object(event);
    self.record(records::GARBAGE_EVENT, vec![arg])
  }

  fn added_edge(&mut self, edge: &EdgeChange) -> Result<()> {
    let args = self.dump_edge(edge);
    self.record(records::ADDED_EDGE, args)
  }

  fn updated_edge_info(&mut self, edge: &EdgeChange) -> Result<()> {
    let args = self.dump_edge(edge);
    self.record(records::UPDATED_EDGE_INFO, args)
  }

  fn removed_edge(
    &mut self,
    relation: RelationKind,
    parent: &PlanObject,
    child: &PlanObject,
  ) -> Result<()> {
    let args = vec![
      self.dump_object(parent.clone()),
      self.dump_object(child.clone()),
      Marshalled::symbol(relation.as_str()),
    ];
    self.record(records::REMOVED_EDGE, args)
  }

  fn mission_changed(&mut self, object: &PlanObject, mission: bool) -> Result<()> {
    let name = if mission {
      records::ADDED_MISSION
    } else {
      records::UNMARKED_MISSION
    };
    let arg = self.dump_object(object.clone());
    self.record(name, vec![arg])
  }

  fn permanent_changed(&mut self, object: &PlanObject, permanent: bool) -> Result<()> {
    let name = if permanent {
      records::ADDED_PERMANENT
    } else {
      records::UNMARKED_PERMANENT
    };
    let arg = self.dump_object(object.clone());
    self.record(name, vec![arg])
  }

  fn task_arguments_updated(&mut self, task: &Arc<Task>, key: &str, value: &Value) -> Result<()> {
    let args = vec![
      self.dump_object(task),
      Marshalled::symbol(key),
      self.marshaller.dump(value),
    ];
    self.record(records::TASK_ARGUMENTS_UPDATED, args)
  }

  fn generator_called(&mut self, event: &Arc<EventGenerator>, context: &Value) -> Result<()> {
    let args = vec![self.dump_object(event), self.marshaller.dump(context)];
    self.record(records::GENERATOR_CALLED, args)
  }

  fn generator_fired(&mut self, event: &Arc<EventGenerator>, emission: &Emission) -> Result<()> {
    let args = vec![
      self.dump_object(event),
      Marshalled::Int(emission.id as i64),
      Marshalled::Time(emission.time),
      self.marshaller.dump(&emission.context),
      Marshalled::Int(emission.propagation_id as i64),
    ];
    self.record(records::GENERATOR_FIRED, args)
  }

  fn generator_emit_failed(&mut self, event: &Arc<EventGenerator>, error: &Value) -> Result<()> {
    let args = vec![self.dump_object(event), self.marshaller.dump(error)];
    self.record(records::GENERATOR_EMIT_FAILED, args)
  }

  fn generator_propagate_events(
    &mut self,
    kind: PropagationKind,
    sources: &[Arc<EventGenerator>],
    target: &Arc<EventGenerator>,
    propagation_id: u64,
  ) -> Result<()> {
    let sources = sources.iter().map(|source| self.dump_object(source)).collect();
    let args = vec![
      Marshalled::symbol(kind.as_str()),
      Marshalled::List(sources),
      self.dump_object(target),
      Marshalled::Int(propagation_id as i64),
    ];
    self.record(records::GENERATOR_PROPAGATE_EVENTS, args)
  }

  fn task_failed_to_start(&mut self, task: &Arc<Task>, reason: &Value) -> Result<()> {
    let args = vec![self.dump_object(task), self.marshaller.dump(reason)];
    self.record(records::TASK_FAILED_TO_START, args)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::logfile::Reader;
  use crate::plan::{Model, Plan};
  use parking_lot::Mutex;

  fn records_named<'a>(cycle: &'a [LogRecord], name: &str) -> Vec<&'a LogRecord> {
    cycle.iter().filter(|record| record.name == name).collect()
  }

  #[test]
  fn test_live_objects_are_refs_until_finalized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("robot.log");
    let logger = EventLogger::open(&path, EventLoggerOptions::new().peer("robot"))
      .expect("open event logger");
    let logger = Arc::new(Mutex::new(logger));
    let mut plan = Plan::new();
    plan.add_observer(logger.clone());

    let target = Task::new(Model::task("Target"));
    let holder = Task::new(Model::task("Holder"));
    plan.add_task(&target).expect("add target");
    plan.add_task(&holder).expect("add holder");
    plan
      .set_task_argument(&holder, "ref", Value::from(target.clone()))
      .expect("set while live");
    plan.remove_task(&target).expect("remove target");
    plan
      .set_task_argument(&holder, "ref", Value::from(target.clone()))
      .expect("set after removal");
    assert!(!logger.lock().marshaller().object_manager().include(&PlanObject::from(&target)));
    logger.lock().flush().expect("flush");

    let mut reader = Reader::open(&path).expect("open log");
    let cycle = reader.load_one_cycle().expect("read").expect("one cycle");
    assert_eq!(cycle[0].name, records::LOG_SESSION);
    assert_eq!(records_named(&cycle, records::MERGED_PLAN).len(), 2);

    let updates = records_named(&cycle, records::TASK_ARGUMENTS_UPDATED);
    assert_eq!(updates.len(), 2);
    assert!(matches!(updates[0].args[0], Marshalled::Ref(_)));
    assert!(matches!(updates[0].args[2], Marshalled::Ref(_)));
    assert!(matches!(updates[1].args[0], Marshalled::Ref(_)));
    assert!(matches!(updates[1].args[2], Marshalled::Object(_)));

    let finalized = records_named(&cycle, records::FINALIZED_TASK);
    assert_eq!(finalized.len(), 1);
    assert!(matches!(finalized[0].args[0], Marshalled::Ref(_)));
  }

  #[test]
  fn test_cycle_end_writes_one_chunk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("robot.log");
    let mut logger = EventLogger::open(&path, EventLoggerOptions::new().peer("robot"))
      .expect("open event logger");
    assert_eq!(logger.pending().len(), 1);

    let start = Timestamp::new(1_700_000_000, 0);
    let info = logger.cycle_info(start, start.add_micros(500));
    logger.cycle_end(&info).expect("cycle_end");
    assert!(logger.pending().is_empty());
    assert_eq!(logger.cycle_count(), 1);
    logger.close().expect("close");

    let mut reader = Reader::open(&path).expect("open log");
    let cycle = reader.load_one_cycle().expect("read").expect("one cycle");
    assert_eq!(cycle.len(), 2);
    assert_eq!(cycle[1].name, CYCLE_END);
    assert!(reader.load_one_cycle().expect("read").is_none());
  }
}
