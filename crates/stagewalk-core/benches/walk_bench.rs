//! # Sequencer Benchmarks
//!
//! Performance benchmarks for building sequences and walking sessions.
//!
//! Run with: `cargo bench -p stagewalk-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use stagewalk_core::{
    Condition, FieldSpec, FieldValue, SequenceDefinition, Sequencer, StepDescriptor, StepId,
    StepStore,
};
use std::hint::black_box;

/// A linear sequence of `size` steps, each with one required numeric field.
/// Every tenth step is skipped when the first step was answered with 0.
fn create_linear_store(size: usize) -> (StepStore, Vec<StepId>) {
    let mut store = StepStore::new();
    let mut order = Vec::with_capacity(size);
    for i in 0..size {
        let id = format!("step-{i}");
        let mut step = StepDescriptor::new(id.as_str())
            .required_by_default(true)
            .field(FieldSpec::numeric("value", Some(0), Some(100)));
        if i > 0 && i % 10 == 0 {
            step = step.skip_if(Condition::equals("step-0", "value", "0"));
        }
        if i + 1 == size {
            step = step.terminal();
        }
        store.register(step).expect("register");
        order.push(StepId::new(id));
    }
    (store, order)
}

fn create_definition(size: usize) -> SequenceDefinition {
    let (store, order) = create_linear_store(size);
    store.build_sequence(&order, "A").expect("build")
}

fn walk(definition: SequenceDefinition, answer: i64) -> Sequencer {
    let mut seq = Sequencer::passive("bench", definition).expect("sequencer");
    seq.start().expect("start");
    while !seq.is_game_over() {
        seq.set_value("value", FieldValue::Integer(answer)).expect("set");
        seq.advance().expect("advance");
    }
    seq
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_build_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_sequence");

    for size in [10, 100, 500].iter() {
        let (store, order) = create_linear_store(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(store.build_sequence(&order, "A").expect("build")));
        });
    }

    group.finish();
}

fn bench_full_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_walk");

    for size in [10, 100, 500].iter() {
        let definition = create_definition(*size);
        group.bench_with_input(BenchmarkId::new("shown", size), size, |b, _| {
            b.iter(|| black_box(walk(definition.clone(), 1)));
        });
        group.bench_with_input(BenchmarkId::new("gated", size), size, |b, _| {
            b.iter(|| black_box(walk(definition.clone(), 0)));
        });
    }

    group.finish();
}

fn bench_back_and_forth(c: &mut Criterion) {
    let definition = create_definition(50);
    c.bench_function("back_and_forth_50", |b| {
        b.iter(|| {
            let mut seq = Sequencer::passive("bench", definition.clone()).expect("sequencer");
            seq.start().expect("start");
            for _ in 0..20 {
                seq.set_value("value", FieldValue::Integer(5)).expect("set");
                seq.advance().expect("advance");
                let _ = seq.go_back();
                seq.advance().expect("advance");
            }
            black_box(seq.history().len())
        });
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let definition = create_definition(100);
    c.bench_function("snapshot_encode_100", |b| {
        let mut seq = Sequencer::passive("bench", definition.clone()).expect("sequencer");
        seq.start().expect("start");
        for _ in 0..50 {
            seq.set_value("value", FieldValue::Integer(7)).expect("set");
            seq.advance().expect("advance");
        }
        b.iter(|| {
            let snapshot = seq.snapshot();
            black_box(stagewalk_core::snapshot_to_bytes(&snapshot).expect("encode"))
        });
    });
}

criterion_group!(
    benches,
    bench_build_sequence,
    bench_full_walk,
    bench_back_and_forth,
    bench_snapshot
);
criterion_main!(benches);
