//! Cycle encoding, writing and replay benchmarks
//!
//! Run with: cargo bench --bench log_cycles

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

extern crate planlog;

use planlog::distributed::Marshalled;
use planlog::logfile::{decode_cycle, encode_cycle, LogRecord, Reader, Writer, WriterOptions};
use planlog::Timestamp;

fn sample_cycle(records: usize) -> Vec<LogRecord> {
  (0..records)
    .map(|i| {
      LogRecord::new(
        "generator_fired",
        Timestamp::new(1_700_000_000, (i % 1_000_000) as u32),
        vec![
          Marshalled::Int(i as i64),
          Marshalled::Time(Timestamp::new(1_700_000_000, 0)),
          Marshalled::map([
            ("x", Marshalled::Float(i as f64 * 0.5)),
            ("frame", Marshalled::symbol("world")),
          ]),
          Marshalled::Int(1),
        ],
      )
    })
    .collect()
}

fn bench_codec(c: &mut Criterion) {
  let mut group = c.benchmark_group("cycle_codec");
  for records in [16usize, 256, 4096] {
    let cycle = sample_cycle(records);
    let payload = encode_cycle(&cycle).expect("encode");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_with_input(BenchmarkId::new("encode", records), &cycle, |b, cycle| {
      b.iter(|| black_box(encode_cycle(black_box(cycle)).expect("encode")));
    });
    group.bench_with_input(BenchmarkId::new("decode", records), &payload, |b, payload| {
      b.iter(|| black_box(decode_cycle(black_box(payload)).expect("decode")));
    });
  }
  group.finish();
}

fn bench_file(c: &mut Criterion) {
  let mut group = c.benchmark_group("log_file");
  let cycle = sample_cycle(256);
  let cycles = 64;

  group.throughput(Throughput::Elements(cycles as u64));
  group.bench_function("write", |b| {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("bench.log");
    b.iter(|| {
      let mut writer = Writer::open(&path, WriterOptions::new()).expect("open writer");
      for _ in 0..cycles {
        writer.dump(&cycle).expect("dump");
      }
      writer.close().expect("close");
    });
  });

  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("bench.log");
  let mut writer = Writer::open(&path, WriterOptions::new()).expect("open writer");
  for _ in 0..cycles {
    writer.dump(&cycle).expect("dump");
  }
  writer.close().expect("close");

  group.bench_function("read", |b| {
    b.iter(|| {
      let mut reader = Reader::open(&path).expect("open reader");
      let mut count = 0;
      while let Some(records) = reader.load_one_cycle().expect("read") {
        count += records.len();
      }
      black_box(count)
    });
  });
  group.bench_function("rebuild_index", |b| {
    let reader = Reader::open(&path).expect("open reader");
    b.iter(|| black_box(reader.rebuild_index().expect("index").cycle_count()));
  });
  group.finish();
}

criterion_group!(benches, bench_codec, bench_file);
criterion_main!(benches);
