use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::path::Path;

use planlog::constants::{FORMAT_VERSION, MAGIC_CODE};
use planlog::distributed::Marshalled;
use planlog::logfile::{guess_version, LogRecord, PluginSet, Reader, Writer, WriterOptions};
use planlog::{PlanLogError, Timestamp};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn cycle(index: i64) -> Vec<LogRecord> {
  let time = Timestamp::new(1_700_000_000 + index, 250_000);
  vec![
    LogRecord::new(
      "generator_fired",
      time,
      vec![Marshalled::Int(index), Marshalled::Str(format!("cycle {index}"))],
    ),
    LogRecord::new(
      "cycle_end",
      time,
      vec![Marshalled::map([
        ("start", Marshalled::Time(time)),
        ("end", Marshalled::Int(1_500)),
        ("cycle_index", Marshalled::Int(index)),
      ])],
    ),
  ]
}

/// Write `count` cycles and return the offset every chunk ends at.
fn write_log(path: &Path, count: i64) -> (u64, Vec<u64>) {
  let mut writer = Writer::open(path, WriterOptions::new()).expect("open writer");
  let data_start = writer.tell();
  let mut ends = Vec::new();
  for index in 0..count {
    writer.dump(&cycle(index)).expect("dump cycle");
    ends.push(writer.tell());
  }
  writer.close().expect("close writer");
  (data_start, ends)
}

#[test]
fn cycles_read_back_in_order() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("plan.log");
  write_log(&path, 3);

  let mut reader = Reader::open(&path).expect("open reader");
  assert_eq!(reader.prologue().version, FORMAT_VERSION);
  let cycles: Vec<_> = reader
    .cycles()
    .collect::<planlog::Result<_>>()
    .expect("read cycles");
  assert_eq!(cycles, vec![cycle(0), cycle(1), cycle(2)]);
  assert!(reader.end_of_file().expect("eof"));

  reader.rewind().expect("rewind");
  let first = reader.load_one_cycle().expect("read").expect("first cycle");
  assert_eq!(first, cycle(0));
}

#[test]
fn truncated_payload_is_reported() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("plan.log");
  let (_, ends) = write_log(&path, 2);

  let file = OpenOptions::new().write(true).open(&path).expect("open log");
  file.set_len(ends[1] - 3).expect("truncate");
  drop(file);

  let mut reader = Reader::open(&path).expect("open reader");
  assert_eq!(reader.load_one_cycle().expect("first").expect("cycle"), cycle(0));
  let err = reader.load_one_cycle().expect_err("second cycle truncated");
  assert!(matches!(err, PlanLogError::TruncatedFile(_)));
  assert!(err.is_structural());
  // The reader stays at the start of the broken chunk.
  assert_eq!(reader.tell().expect("tell"), ends[0]);
}

#[test]
fn truncated_length_field_is_reported() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("plan.log");
  let (_, ends) = write_log(&path, 1);

  let mut file = OpenOptions::new().append(true).open(&path).expect("open log");
  file.write_all(&[0x10, 0x00]).expect("append partial length");
  drop(file);

  let mut reader = Reader::open(&path).expect("open reader");
  reader.load_one_cycle().expect("first").expect("cycle");
  assert_eq!(reader.tell().expect("tell"), ends[0]);
  let err = reader.load_one_cycle().expect_err("partial length");
  assert!(matches!(err, PlanLogError::TruncatedFile(_)));
}

#[test]
fn random_truncation_never_yields_partial_cycles() {
  let dir = tempfile::tempdir().expect("tempdir");
  let full = dir.path().join("full.log");
  let (data_start, ends) = write_log(&full, 5);
  let bytes = fs::read(&full).expect("read log");

  let mut rng = StdRng::seed_from_u64(0x5eed);
  for round in 0..64 {
    let cut = rng.gen_range(data_start..=bytes.len() as u64);
    let path = dir.path().join(format!("cut-{round}.log"));
    fs::write(&path, &bytes[..cut as usize]).expect("write truncated copy");

    let mut reader = Reader::open(&path).expect("open truncated log");
    let mut complete = 0;
    let outcome = loop {
      match reader.load_one_cycle() {
        Ok(Some(records)) => {
          assert_eq!(records, cycle(complete as i64));
          complete += 1;
        }
        Ok(None) => break Ok(()),
        Err(err) => break Err(err),
      }
    };

    let expected = ends.iter().filter(|end| **end <= cut).count();
    assert_eq!(complete, expected, "cut at {cut}");
    let on_boundary = cut == data_start || ends.contains(&cut);
    match outcome {
      Ok(()) => assert!(on_boundary, "clean end expected only on a boundary (cut {cut})"),
      Err(err) => {
        assert!(!on_boundary, "unexpected error at boundary {cut}: {err}");
        assert!(matches!(err, PlanLogError::TruncatedFile(_)));
      }
    }
  }
}

#[test]
fn format_version_is_checked() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("old.log");
  let writer = Writer::open(&path, WriterOptions::new().version(FORMAT_VERSION - 1))
    .expect("open writer");
  writer.close().expect("close");

  let mut raw = Cursor::new(fs::read(&path).expect("read"));
  assert_eq!(guess_version(&mut raw), Some(FORMAT_VERSION - 1));
  assert_eq!(raw.position(), 0);

  let err = Reader::open(&path).expect_err("old version refused");
  assert!(matches!(
    err,
    PlanLogError::InvalidFormatVersion { found, expected }
      if found == FORMAT_VERSION - 1 && expected == FORMAT_VERSION
  ));
}

#[test]
fn bad_magic_is_not_a_log_file() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("garbage.log");
  fs::write(&path, b"definitely not a log file").expect("write");
  let err = Reader::open(&path).expect_err("bad magic");
  assert!(matches!(err, PlanLogError::InvalidFile(_)));

  let partial = dir.path().join("partial.log");
  fs::write(&partial, &MAGIC_CODE[..5]).expect("write");
  let err = Reader::open(&partial).expect_err("partial magic");
  assert!(matches!(err, PlanLogError::InvalidFile(_)));
}

#[test]
fn declared_plugins_must_be_activated() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("plugins.log");
  let mut writer = Writer::open(&path, WriterOptions::new().plugin("planning-ext"))
    .expect("open writer");
  writer.dump(&cycle(0)).expect("dump");
  writer.close().expect("close");

  let err = Reader::open(&path).expect_err("plugin refused");
  assert!(matches!(err, PlanLogError::UnknownPlugin(ref name) if name == "planning-ext"));

  let mut reader = Reader::open_with_plugins(&path, &PluginSet::new().with("planning-ext"))
    .expect("plugin accepted");
  assert_eq!(reader.plugins(), ["planning-ext".to_string()]);
  assert_eq!(reader.load_one_cycle().expect("read").expect("cycle"), cycle(0));

  let by_closure = Reader::open_with_plugins(&path, &|name: &str| name.ends_with("-ext"));
  assert!(by_closure.is_ok());
}

#[test]
fn writer_refuses_opaque_values() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("opaque.log");
  let mut writer = Writer::open(&path, WriterOptions::new()).expect("open writer");
  let before = writer.tell();

  let bad = vec![LogRecord::new(
    "task_arguments_updated",
    Timestamp::new(1, 0),
    vec![Marshalled::Nil, Marshalled::symbol("goal"), Marshalled::Opaque("Socket".into())],
  )];
  let err = writer.dump(&bad).expect_err("opaque value");
  assert!(matches!(err, PlanLogError::Unmarshallable(_)));
  assert_eq!(writer.tell(), before);

  writer.dump(&cycle(0)).expect("later cycles still written");
  writer.close().expect("close");
  let mut reader = Reader::open(&path).expect("open reader");
  assert_eq!(reader.load_one_cycle().expect("read").expect("cycle"), cycle(0));
}
