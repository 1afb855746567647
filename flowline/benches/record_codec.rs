//! Benchmarks for the flat record codec.
//!
//! These benchmarks measure:
//! - Job record encoding to field maps
//! - Job record decoding from field maps
//! - Id list encoding for wide fan-outs

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use flowline::job::{JobId, JobRecord};
use flowline::store::record::{decode_job, encode_ids, encode_job};
use flowline::workflow::WorkflowId;

fn sample_job(edges: usize) -> JobRecord {
    let mut job = JobRecord::new(
        WorkflowId::new(),
        "Transcode",
        vec![json!("s3://bucket/input.mov"), json!({"width": 1920, "height": 1080})],
    );
    job.after = (0..edges).map(|_| JobId::new()).collect();
    job.before = (0..edges).map(|_| JobId::new()).collect();
    job.enqueue();
    job.mark_started();
    job.record_error("encoder crashed");
    job
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_job");
    for edges in [0usize, 8, 64] {
        let job = sample_job(edges);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(edges), &job, |b, job| {
            b.iter(|| encode_job(black_box(job)).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_job");
    for edges in [0usize, 8, 64] {
        let job = sample_job(edges);
        let fields = encode_job(&job).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(edges), &fields, |b, fields| {
            b.iter(|| decode_job("job::bench", job.id, black_box(fields)).unwrap());
        });
    }
    group.finish();
}

fn bench_id_lists(c: &mut Criterion) {
    let ids: Vec<JobId> = (0..256).map(|_| JobId::new()).collect();
    c.bench_function("encode_ids_256", |b| b.iter(|| encode_ids(black_box(&ids))));
}

criterion_group!(benches, bench_encode, bench_decode, bench_id_lists);
criterion_main!(benches);
