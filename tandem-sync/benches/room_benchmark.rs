use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_sync::session::coalesce;
use tandem_sync::{
    ClientMessage, ConnectRequest, DataMessage, FieldKind, MemorySocket, Mutation, Patch, Push,
    RecordStore, RecordType, RecordsDiff, ReplicaStore, Room, RoomConfig, Schema, ServerMessage,
};

fn schema() -> Schema {
    Schema::new(1).with_type(
        RecordType::document("shape")
            .field("x", FieldKind::Number)
            .field("y", FieldKind::Number),
    )
}

fn shapes(n: usize) -> Vec<Mutation> {
    (0..n)
        .map(|i| Mutation::upsert(format!("shape:{i}"), "shape", json!({ "x": i, "y": i * 2 })))
        .collect()
}

fn push_frame(key: &str, push_id: u64, mutations: Vec<Mutation>) -> Vec<u8> {
    ClientMessage::Push(Push {
        session_key: key.into(),
        push_id,
        mutations,
        presence: None,
    })
    .encode()
    .unwrap()
}

/// A room with `peers` connected sessions.
fn populated_room(peers: usize) -> (Room, Vec<Arc<MemorySocket>>, Instant) {
    let now = Instant::now();
    let mut room = Room::new("bench", RoomConfig::default().with_schema(schema()));
    let mut sockets = Vec::with_capacity(peers);
    for i in 0..peers {
        let key = format!("peer{i}");
        let socket = MemorySocket::new();
        room.handle_new_session(&key, socket.clone(), now);
        let hello = ClientMessage::Connect(ConnectRequest {
            session_key: key.clone(),
            presence_id: format!("presence:{key}"),
            schema: schema().descriptor(),
            last_known_clock: None,
        });
        room.handle_message(&key, &hello.encode().unwrap(), now).unwrap();
        sockets.push(socket);
    }
    (room, sockets, now)
}

fn bench_push_encode(c: &mut Criterion) {
    let mutations = shapes(10);

    c.bench_function("push_encode_10_mutations", |b| {
        b.iter(|| black_box(push_frame("peer0", 1, black_box(mutations.clone()))))
    });
}

fn bench_push_decode(c: &mut Criterion) {
    let encoded = push_frame("peer0", 1, shapes(10));

    c.bench_function("push_decode_10_mutations", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let (mut room, _sockets, now) = populated_room(1);
    room.handle_message("peer0", &push_frame("peer0", 1, shapes(1000)), now)
        .unwrap();
    let records = room.snapshot().records;

    c.bench_function("snapshot_encode_1000_records", |b| {
        b.iter(|| {
            let msg = ServerMessage::Data(vec![DataMessage::Patch(Patch::new(
                0,
                1,
                records.iter().cloned().fold(RecordsDiff::new(), |mut diff, r| {
                    diff.put(r);
                    diff
                }),
            ))]);
            black_box(msg.encode().unwrap())
        })
    });
}

fn bench_store_apply(c: &mut Criterion) {
    let schema = schema();
    let mutations = shapes(1000);

    c.bench_function("store_apply_1000_mutations", |b| {
        b.iter_batched(
            || (RecordStore::new(3000, 300), mutations.clone()),
            |(mut store, mutations)| black_box(store.apply(&schema, mutations)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_room_push_100_peers(c: &mut Criterion) {
    let frame = push_frame("peer0", 1, shapes(1));

    c.bench_function("room_push_broadcast_100_peers", |b| {
        b.iter_batched(
            || populated_room(100),
            |(mut room, sockets, now)| {
                room.handle_message("peer0", &frame, now).unwrap();
                black_box(sockets)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_room_debounced_flush(c: &mut Criterion) {
    c.bench_function("room_flush_50_pushes_20_peers", |b| {
        b.iter_batched(
            || {
                let (mut room, sockets, now) = populated_room(20);
                for i in 0..50u64 {
                    let frame = push_frame("peer0", i + 1, shapes(2));
                    room.handle_message("peer0", &frame, now).unwrap();
                }
                (room, sockets, now)
            },
            |(mut room, sockets, now)| {
                black_box(room.tick(now + Duration::from_millis(100)));
                black_box(sockets)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_coalesce_patches(c: &mut Criterion) {
    let messages: Vec<DataMessage> = (0..100u64)
        .map(|i| {
            let mut diff = RecordsDiff::new();
            for m in shapes(5) {
                diff.remove(m.record_id);
            }
            DataMessage::Patch(Patch::new(i, i + 1, diff))
        })
        .collect();

    c.bench_function("coalesce_100_patches", |b| {
        b.iter_batched(
            || messages.clone(),
            |messages| black_box(coalesce(messages)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_replica_apply_patch(c: &mut Criterion) {
    let (mut room, sockets, now) = populated_room(2);
    room.handle_message("peer0", &push_frame("peer0", 1, shapes(500)), now)
        .unwrap();
    let patch = sockets[1]
        .take_messages()
        .unwrap()
        .into_iter()
        .find_map(|msg| match msg {
            ServerMessage::Data(batch) => batch.into_iter().find_map(|d| match d {
                DataMessage::Patch(patch) => Some(patch),
                DataMessage::PushResult(_) => None,
            }),
            _ => None,
        })
        .unwrap();

    c.bench_function("replica_apply_patch_500_records", |b| {
        b.iter_batched(
            ReplicaStore::new,
            |mut replica| {
                replica.apply_patch(black_box(&patch)).unwrap();
                black_box(replica)
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_push_encode,
    bench_push_decode,
    bench_snapshot_encode,
    bench_store_apply,
    bench_room_push_100_peers,
    bench_room_debounced_flush,
    bench_coalesce_patches,
    bench_replica_apply_patch,
);
criterion_main!(benches);
