use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use playpen_collab::broadcast::BroadcastGroup;
use playpen_collab::presence::AwarenessService;
use playpen_collab::protocol::{PeerInfo, SyncMessage};
use playpen_core::{BufferKind, DocumentId, Replica, TextPatch, YrsReplica};
use uuid::Uuid;

fn channel() -> DocumentId {
    DocumentId::derive("/bench", BufferKind::Script)
}

fn protocol(c: &mut Criterion) {
    let mut replica = YrsReplica::new();
    let op = replica
        .apply(&TextPatch::insert(0, "console.log('tick');"))
        .expect("local edit");
    let sender = replica.id();
    let wire = SyncMessage::delta(sender, channel(), &op)
        .and_then(|m| m.encode())
        .expect("encode");

    let presence = AwarenessService::new(
        PeerInfo::new("Bench"),
        BufferKind::Script,
        Duration::from_secs(30),
    )
    .local_state();

    let mut group = c.benchmark_group("Protocol");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("encode delta", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(sender, channel(), black_box(&op)).expect("delta");
            black_box(msg.encode().expect("encode"))
        })
    });
    group.bench_function("decode delta", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&wire)).expect("decode");
            black_box(msg.replica_op().expect("op"))
        })
    });
    group.bench_function("encode presence", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(sender, channel(), black_box(&presence))
                .expect("presence");
            black_box(msg.encode().expect("encode"))
        })
    });
    group.finish();
}

fn fan_out(c: &mut Criterion) {
    const PEERS: usize = 100;
    const FRAMES: u64 = 1000;

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("FanOut");
    group.throughput(Throughput::Elements(FRAMES));
    group.bench_function("1000 frames to 100 peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = BroadcastGroup::new(FRAMES as usize);
                let mut receivers = Vec::with_capacity(PEERS);
                for n in 0..PEERS {
                    receivers.push(room.add_peer(PeerInfo::new(format!("P{n}"))).await);
                }
                let ping = SyncMessage::ping(Uuid::new_v4());
                for _ in 0..FRAMES {
                    black_box(room.broadcast(&ping).expect("broadcast"));
                }
            })
        })
    });
    group.finish();
}

criterion_group!(benches, protocol, fan_out);
criterion_main!(benches);
