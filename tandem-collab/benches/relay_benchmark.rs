use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tandem_collab::broadcast::BroadcastRoom;
use tandem_collab::presence::{color_for, CursorData, CursorPosition, PresenceUser};
use tandem_collab::protocol::{decode, encode, ClientMessage, ServerMessage};
use tandem_collab::registry::RoomRegistry;
use tandem_core::StorageOp;
use uuid::Uuid;

fn sample_ops(n: usize) -> Vec<StorageOp> {
    (0..n)
        .map(|i| StorageOp::Set {
            path: vec!["shapes".to_string(), format!("shape-{i}")],
            key: "x".to_string(),
            value: (i as f64).into(),
            clock: i as u64 + 1,
        })
        .collect()
}

fn bench_storage_ops_encode(c: &mut Criterion) {
    let msg = ClientMessage::StorageOps {
        ops: sample_ops(16),
        clock: Some(16),
    };

    c.bench_function("storage_ops_encode_16", |b| {
        b.iter(|| black_box(encode(black_box(&msg)).unwrap()))
    });
}

fn bench_storage_ops_decode(c: &mut Criterion) {
    let text = encode(&ServerMessage::StorageOps {
        ops: sample_ops(16),
        clock: Some(16),
    })
    .unwrap();

    c.bench_function("storage_ops_decode_16", |b| {
        b.iter(|| black_box(decode::<ServerMessage>(black_box(&text)).unwrap()))
    });
}

fn bench_cursor_stamp_encode(c: &mut Criterion) {
    let user = PresenceUser::new("alice", "Alice");

    c.bench_function("cursor_stamp_encode", |b| {
        b.iter(|| {
            let cursor = CursorData::stamp(&user, CursorPosition::at(black_box(10.0), 20.0));
            black_box(encode(&ServerMessage::CursorUpdate { cursor }).unwrap());
        })
    });
}

fn bench_color_for(c: &mut Criterion) {
    c.bench_function("color_for_user_id", |b| {
        b.iter(|| black_box(color_for(black_box("user-4f1c2a"))))
    });
}

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_connections", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = BroadcastRoom::new("bench", 1024, 200);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let user = PresenceUser::new(format!("user{i}"), format!("User {i}"));
                    receivers.push(room.add_connection(Uuid::new_v4(), user).await.unwrap());
                }

                let payload: Arc<str> = Arc::from(r#"{"type":"chat","text":"hi"}"#);
                black_box(room.broadcast_raw(None, black_box(payload)));
            });
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_connections", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = BroadcastRoom::new("bench", 2048, 200);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let user = PresenceUser::new(format!("user{i}"), format!("User {i}"));
                    receivers.push(room.add_connection(Uuid::new_v4(), user).await.unwrap());
                }

                let payload: Arc<str> = Arc::from(r#"{"type":"chat","text":"hi"}"#);
                for _ in 0..1000 {
                    room.broadcast_raw(None, black_box(payload.clone()));
                }
            });
        })
    });
}

fn bench_replica_apply(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ops: Vec<StorageOp> = (0..100)
        .map(|i| StorageOp::Set {
            path: vec![],
            key: format!("k{i}"),
            value: (i as f64).into(),
            clock: i + 1,
        })
        .collect();

    c.bench_function("replica_apply_100_ops", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = BroadcastRoom::new("bench", 16, 10);
                black_box(room.apply_ops(black_box(&ops)).await);
            });
        })
    });
}

fn bench_registry_get_or_create(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = RoomRegistry::new(64, 100);

    c.bench_function("registry_get_or_create_hot", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(registry.get_or_create(black_box("board")).await);
            });
        })
    });
}

criterion_group!(
    benches,
    bench_storage_ops_encode,
    bench_storage_ops_decode,
    bench_cursor_stamp_encode,
    bench_color_for,
    bench_broadcast_raw,
    bench_broadcast_1000_messages,
    bench_replica_apply,
    bench_registry_get_or_create,
);
criterion_main!(benches);
