use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use logsync::broadcast::{ConnectionHandle, ConnectionRegistry};
use logsync::client::{ClientState, StateMachine};
use logsync::event_log::EventLog;
use logsync::protocol::{ClientMessage, LogEntry};

fn bench_entry_encode(c: &mut Criterion) {
    let entry = LogEntry::new(1234, json!({"type": "increment"}));

    c.bench_function("entry_encode", |b| {
        b.iter(|| black_box(black_box(&entry).encode().unwrap()))
    });
}

fn bench_entry_decode(c: &mut Criterion) {
    let encoded = LogEntry::new(1234, json!({"type": "increment"}))
        .encode()
        .unwrap();

    c.bench_function("entry_decode", |b| {
        b.iter(|| black_box(LogEntry::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = ClientMessage::update(json!({"type": "increment"}))
        .encode()
        .unwrap();

    c.bench_function("update_decode", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_log_append_1k(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("log_append_1k_in_memory", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut log = EventLog::in_memory();
                for i in 0..1000u64 {
                    log.append(json!({"n": i})).await.unwrap();
                }
                black_box(log.len())
            })
        })
    });
}

fn bench_log_replay_1k(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let log = rt.block_on(async {
        let mut log = EventLog::in_memory();
        for i in 0..1000u64 {
            log.append(json!({"n": i})).await.unwrap();
        }
        log
    });

    c.bench_function("log_replay_1k", |b| {
        b.iter(|| black_box(log.replay().len()))
    });
}

fn bench_broadcast_100_connections(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut registry = ConnectionRegistry::new();
    let mut receivers = Vec::new();
    for _ in 0..100 {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(Uuid::new_v4(), ConnectionHandle::new(tx), Vec::new());
        receivers.push(rx);
    }
    let entry = LogEntry::new(0, json!({"type": "increment"}));

    c.bench_function("broadcast_100_connections", |b| {
        b.iter(|| {
            black_box(registry.broadcast(black_box(&entry)));
            for rx in &mut receivers {
                black_box(rx.try_recv().unwrap());
            }
        })
    });
}

fn bench_state_machine_fold_1k(c: &mut Criterion) {
    c.bench_function("state_machine_fold_1k", |b| {
        b.iter(|| {
            let mut machine: StateMachine<i64, serde_json::Value> = StateMachine::new(
                0,
                Box::new(|state, _| state + 1),
                Box::new(|_| {}),
            );
            machine.handle_open();
            for i in 0..1000u64 {
                machine.handle_entry(LogEntry::new(i, json!({"n": i})));
            }
            assert!(matches!(
                machine.state(),
                ClientState::Connected {
                    app_state: 1000,
                    ..
                }
            ));
        })
    });
}

criterion_group!(
    benches,
    bench_entry_encode,
    bench_entry_decode,
    bench_update_decode,
    bench_log_append_1k,
    bench_log_replay_1k,
    bench_broadcast_100_connections,
    bench_state_machine_fold_1k,
);
criterion_main!(benches);
