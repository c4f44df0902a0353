//! Integration tests for signals, slots, connections and workers
//!
//! These tests verify:
//! - Delivery onto the slot's worker and FIFO order per worker
//! - Chained delivery across two workers
//! - Fan-out from a foreign thread to slots on two workers
//! - Concurrent emission from several threads
//! - Counted blocking (property based)
//! - Connection teardown when either endpoint is dropped

use parking_lot::Mutex;
use proptest::prelude::*;
use slotwork::{CoreError, DeliveryMode, Signal, Slot, Worker};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Wait until every task posted to `worker` so far has run
fn flush(worker: &Worker) {
    worker.post(|| ()).wait().unwrap();
}

#[test]
fn test_async_emit_runs_on_slot_worker_in_order() {
    let worker = Worker::new("ordered").unwrap();
    let current = worker.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let slot = Slot::new("record", move |value: u32| {
        assert!(current.is_current());
        sink.lock().push(value);
    })
    .with_worker(worker.clone());

    let signal = Signal::<u32>::new("values");
    signal.connect(&slot).unwrap();

    for value in 0..100 {
        assert_eq!(signal.async_emit(value), 1);
    }
    flush(&worker);

    assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    worker.stop();
}

#[test]
fn test_round_trip_across_two_workers() {
    let first = Worker::new("first").unwrap();
    let second = Worker::new("second").unwrap();
    let trace = Arc::new(Mutex::new(Vec::new()));

    // second hop: runs on `second`
    let relayed = Signal::<String>::new("relayed");
    let sink = Arc::clone(&trace);
    let on_second = second.clone();
    let end = Slot::new("end", move |text: String| {
        sink.lock().push(format!("{text} on second={}", on_second.is_current()));
    })
    .with_worker(second.clone());
    relayed.connect(&end).unwrap();

    // first hop: runs on `first` and forwards
    let forward = relayed.clone();
    let sink = Arc::clone(&trace);
    let on_first = first.clone();
    let relay = Slot::new("relay", move |text: String| {
        sink.lock().push(format!("{text} on first={}", on_first.is_current()));
        forward.notify(format!("{text}!"));
    })
    .with_worker(first.clone());

    let source = Signal::<String>::with_mode("source", DeliveryMode::Async);
    source.connect(&relay).unwrap();

    source.notify("ping".to_string());
    flush(&first);
    flush(&second);

    assert_eq!(
        *trace.lock(),
        vec![
            "ping on first=true".to_string(),
            "ping! on second=true".to_string()
        ]
    );

    first.stop();
    second.stop();
}

#[test]
fn test_async_emit_reaches_each_worker_once() {
    let workers = [Worker::new("fan-a").unwrap(), Worker::new("fan-b").unwrap()];
    let signal = Signal::<u32>::new("fan_out");

    let mut slots = Vec::new();
    let mut logs = Vec::new();
    for worker in &workers {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let home = worker.clone();
        let slot = Slot::new("record", move |value: u32| {
            sink.lock().push((value, home.is_current()));
        })
        .with_worker(worker.clone());
        signal.connect(&slot).unwrap();
        slots.push(slot);
        logs.push(log);
    }

    let emitter = signal.clone();
    let delivered = thread::spawn(move || emitter.async_emit(7)).join().unwrap();
    assert_eq!(delivered, 2);

    for worker in &workers {
        flush(worker);
    }
    for log in &logs {
        assert_eq!(*log.lock(), vec![(7, true)]);
    }

    for worker in &workers {
        worker.stop();
    }
}

#[test]
fn test_concurrent_emitters_deliver_everything() {
    let worker = Worker::new("sink").unwrap();
    let total = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&total);
    let slot = Slot::new("count", move |n: usize| {
        counter.fetch_add(n, Ordering::SeqCst);
    })
    .with_worker(worker.clone());

    let signal = Signal::<usize>::new("ticks");
    signal.connect(&slot).unwrap();

    thread::scope(|scope| {
        for _ in 0..4 {
            let signal = signal.clone();
            scope.spawn(move || {
                for _ in 0..500 {
                    signal.async_emit(1);
                }
            });
        }
    });
    flush(&worker);

    assert_eq!(total.load(Ordering::SeqCst), 2000);
    assert_eq!(worker.metrics().finished(), 2001);
    worker.stop();
}

#[test]
fn test_connect_and_disconnect_while_emitting() {
    let signal = Signal::<()>::synchronous("busy");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let stable = Slot::new("stable", move |_: ()| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    signal.connect(&stable).unwrap();

    thread::scope(|scope| {
        let emitter = signal.clone();
        scope.spawn(move || {
            for _ in 0..1000 {
                emitter.emit(());
            }
        });

        let churn = signal.clone();
        scope.spawn(move || {
            for i in 0..200 {
                let slot = Slot::new(format!("temp-{i}"), |_: ()| {});
                let connection = churn.connect(&slot).unwrap();
                connection.disconnect();
            }
        });
    });

    assert_eq!(hits.load(Ordering::SeqCst), 1000);
    assert_eq!(signal.connection_count(), 1);
}

#[test]
fn test_dropping_slot_disconnects() {
    let signal = Signal::<i32>::synchronous("values");
    let slot = Slot::new("gone", |_: i32| {});
    let connection = signal.connect(&slot).unwrap();

    drop(slot);
    assert!(!connection.is_connected());
    assert_eq!(signal.emit(1), 0);
    assert_eq!(signal.connection_count(), 0);
}

#[test]
fn test_dropping_signal_disconnects() {
    let signal = Signal::<i32>::synchronous("values");
    let slot = Slot::new("kept", |_: i32| {});
    let connection = signal.connect(&slot).unwrap();
    let weak = signal.downgrade();

    drop(signal);
    assert!(!connection.is_connected());
    assert_eq!(slot.connection_count(), 0);
    assert!(matches!(weak.emit(1), Err(CoreError::DanglingEndpoint(_))));
}

#[test]
fn test_duplicate_connection_rejected() {
    let signal = Signal::<i32>::new("values");
    let slot = Slot::new("once", |_: i32| {});
    signal.connect(&slot).unwrap();

    let err = signal.connect(&slot).unwrap_err();
    assert!(matches!(err, CoreError::AlreadyConnected { .. }));
    assert_eq!(signal.connection_count(), 1);
}

#[test]
fn test_posting_to_stopped_worker() {
    let worker = Worker::new("short-lived").unwrap();
    worker.stop();
    let err = worker.post(|| 1).wait().unwrap_err();
    assert!(matches!(err, CoreError::WorkerStopped(name) if name == "short-lived"));
}

#[test]
fn test_panicking_task_keeps_worker_alive() {
    let worker = Worker::new("sturdy").unwrap();
    let err = worker.post(|| -> u32 { panic!("boom") }).wait().unwrap_err();
    assert!(matches!(err, CoreError::TaskPanicked { ref message, .. } if message == "boom"));

    assert_eq!(worker.post(|| 2 + 2).wait().unwrap(), 4);
    worker.stop();
}

#[tokio::test]
async fn test_join_async_slot_run() {
    let worker = Worker::new("joined").unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let slot = Slot::new("count", move |_: ()| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .with_worker(worker.clone());

    slot.async_run(()).join().await.unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    let value = worker.post(|| "done").join().await.unwrap();
    assert_eq!(value, "done");
    tokio::task::spawn_blocking(move || worker.stop()).await.unwrap();
}

#[test]
fn test_join_outside_a_runtime() {
    let worker = Worker::new("blocking-join").unwrap();
    let value = tokio_test::block_on(worker.post(|| 21 * 2).join()).unwrap();
    assert_eq!(value, 42);

    let ready = tokio_test::block_on(slotwork::TaskHandle::ready("inline").join()).unwrap();
    assert_eq!(ready, "inline");
    worker.stop();
}

#[derive(Debug, Clone)]
enum BlockOp {
    Block,
    Unblock,
}

fn block_op() -> impl Strategy<Value = BlockOp> {
    prop_oneof![Just(BlockOp::Block), Just(BlockOp::Unblock)]
}

proptest! {
    #[test]
    fn prop_blocking_is_counted(ops in prop::collection::vec(block_op(), 0..40)) {
        let signal = Signal::<u8>::synchronous("guarded");
        let slot = Slot::new("target", |_: u8| {});
        let connection = signal.connect(&slot).unwrap();

        let mut depth = 0usize;
        for op in &ops {
            match op {
                BlockOp::Block => {
                    connection.block();
                    depth += 1;
                }
                BlockOp::Unblock => {
                    connection.unblock();
                    depth = depth.saturating_sub(1);
                }
            }
            prop_assert_eq!(connection.block_count(), depth);
            let expected = if depth == 0 { 1 } else { 0 };
            prop_assert_eq!(signal.emit(0), expected);
        }
    }

    #[test]
    fn prop_blocker_guards_unwind_in_any_order(
        depth in 1usize..10,
        release_reversed in any::<bool>(),
    ) {
        let signal = Signal::<u8>::synchronous("guarded");
        let slot = Slot::new("target", |_: u8| {});
        let connection = signal.connect(&slot).unwrap();

        let mut guards: Vec<_> = (0..depth).map(|_| connection.blocker()).collect();
        prop_assert_eq!(signal.emit(0), 0);

        if release_reversed {
            guards.reverse();
        }
        while let Some(guard) = guards.pop() {
            prop_assert!(connection.is_blocked());
            drop(guard);
        }
        prop_assert!(!connection.is_blocked());
        prop_assert_eq!(signal.emit(0), 1);
    }
}
