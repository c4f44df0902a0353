//! Benchmark: signal emission cost
//!
//! Measures synchronous emission against a growing number of connected
//! slots, the cost of skipping blocked connections, and asynchronous
//! emission onto a worker queue (including the wait for the queue to drain).

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use slotwork::{Signal, Slot, Worker};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn counting_slots(count: usize, total: &Arc<AtomicU64>) -> Vec<Slot<u64>> {
    (0..count)
        .map(|i| {
            let total = Arc::clone(total);
            Slot::new(format!("slot-{i}"), move |value: u64| {
                total.fetch_add(value, Ordering::Relaxed);
            })
        })
        .collect()
}

fn bench_sync_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_emit");

    for fan_out in [1usize, 8, 64] {
        let total = Arc::new(AtomicU64::new(0));
        let slots = counting_slots(fan_out, &total);
        let signal = Signal::<u64>::synchronous("bench");
        for slot in &slots {
            signal.connect(slot).unwrap();
        }

        group.throughput(Throughput::Elements(fan_out as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fan_out), &fan_out, |b, _| {
            b.iter(|| black_box(signal.emit(black_box(1))));
        });
    }

    group.finish();
}

fn bench_blocked_emit(c: &mut Criterion) {
    let total = Arc::new(AtomicU64::new(0));
    let slots = counting_slots(8, &total);
    let signal = Signal::<u64>::synchronous("blocked");
    let blockers: Vec<_> = slots
        .iter()
        .map(|slot| signal.connect(slot).unwrap().blocker())
        .collect();

    c.bench_function("blocked_emit/8", |b| {
        b.iter(|| black_box(signal.emit(black_box(1))));
    });

    drop(blockers);
}

fn bench_async_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_emit");
    let worker = Worker::new("bench").unwrap();
    let total = Arc::new(AtomicU64::new(0));
    let slot = counting_slots(1, &total)
        .pop()
        .unwrap()
        .with_worker(worker.clone());
    let signal = Signal::<u64>::new("bench");
    signal.connect(&slot).unwrap();

    for batch in [1u64, 100] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                for value in 0..batch {
                    signal.async_emit(value);
                }
                worker.post(|| ()).wait().unwrap();
            });
        });
    }

    group.finish();
    worker.stop();
}

criterion_group!(benches, bench_sync_emit, bench_blocked_emit, bench_async_emit);
criterion_main!(benches);
