use criterion::{criterion_group, criterion_main, Criterion};
use logos_canvas::{
    CanvasObject, Color, CommitRecord, Field, FieldPatch, FieldValue, ObjectId, OpId, OpKind,
    Operation, SiteId, Snapshot,
};
use logos_collab::broadcast::{BroadcastGroup, LocalSink};
use logos_collab::protocol::{PeerInfo, SyncMessage};
use logos_collab::sequencer::{Sequencer, SequencerConfig};
use logos_collab::session::{ClientSession, SessionConfig};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn rect(n: u128, site: SiteId) -> CanvasObject {
    CanvasObject::rectangle(ObjectId::from_u128(n), site, n as f64, 0.0, 40.0, 40.0)
}

fn fill(c: u8) -> FieldPatch {
    FieldPatch::new().with(Field::Fill, FieldValue::Color(Some(Color::rgb(c, 0, 0))))
}

fn update_op() -> Operation {
    Operation::update(OpId::new(SiteId(7), 12), 40, ObjectId::from_u128(3), fill(128)).unwrap()
}

fn bench_submit_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let op = update_op();

    c.bench_function("submit_encode_update", |b| {
        b.iter(|| {
            let msg = SyncMessage::submit(black_box(peer), black_box(doc), black_box(&op)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_commit_decode(c: &mut Criterion) {
    let record = CommitRecord {
        seq: 41,
        op: update_op(),
        committed_at: 41,
    };
    let encoded = SyncMessage::commit(Uuid::new_v4(), Uuid::new_v4(), &record)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("commit_decode_update", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.commit_record().unwrap());
        })
    });
}

fn bench_snapshot_encode_1000(c: &mut Criterion) {
    let objects: Vec<CanvasObject> = (0..1000).map(|n| rect(n, SiteId(1))).collect();
    let snapshot = Snapshot::live(1000, objects);
    let doc = Uuid::new_v4();

    c.bench_function("snapshot_encode_1000_objects", |b| {
        b.iter(|| {
            let msg = SyncMessage::snapshot(doc, black_box(&snapshot)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_peer_info_new(c: &mut Criterion) {
    c.bench_function("peer_info_new", |b| {
        b.iter(|| {
            black_box(PeerInfo::new(black_box("Benchmark User")));
        })
    });
}

/// Sequencer with `objects` rectangles committed by one site.
fn seeded_sequencer(objects: u128) -> Sequencer {
    let mut seq = Sequencer::new(SequencerConfig::default(), Arc::new(LocalSink::new()));
    for n in 0..objects {
        let op = Operation::insert(OpId::new(SiteId(1), n as u64 + 1), n as u64, rect(n, SiteId(1))).unwrap();
        seq.submit(op).unwrap();
    }
    seq
}

fn bench_sequencer_submit_rebased(c: &mut Criterion) {
    // Each submission is 64 commits behind and has to be rebased across them.
    c.bench_function("sequencer_submit_rebase_64", |b| {
        b.iter_batched(
            || seeded_sequencer(64),
            |mut seq| {
                let op = Operation::update(OpId::new(SiteId(2), 1), 0, ObjectId::from_u128(0), fill(9)).unwrap();
                black_box(seq.submit(op).unwrap());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_session_remote_over_pending(c: &mut Criterion) {
    let base: Vec<CanvasObject> = (0..32).map(|n| rect(n, SiteId(2))).collect();
    let snapshot = Snapshot::live(32, base);
    let remote = CommitRecord {
        seq: 33,
        op: Operation {
            id: OpId::new(SiteId(2), 99),
            base_seq: 32,
            kind: OpKind::Update {
                target: ObjectId::from_u128(5),
                patch: fill(77),
            },
        },
        committed_at: 33,
    };

    c.bench_function("session_remote_commit_16_pending", |b| {
        b.iter_batched(
            || {
                let mut session = ClientSession::from_snapshot(SiteId(1), snapshot.clone(), SessionConfig::default());
                for n in 0..16u8 {
                    session.update(ObjectId::from_u128(u128::from(n % 8)), fill(n)).unwrap();
                }
                session.take_outgoing();
                session
            },
            |mut session| {
                session.receive(black_box(&remote)).unwrap();
                black_box(session.drain_deltas());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_broadcast_raw_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        let group = BroadcastGroup::new(Uuid::new_v4(), 1024);
        let mut _receivers = Vec::new();
        rt.block_on(async {
            for i in 0..100 {
                _receivers.push(group.add_peer(PeerInfo::new(format!("peer_{i}"))).await);
            }
        });
        let data = Arc::new(vec![0u8; 64]);

        b.iter(|| {
            black_box(group.broadcast_raw(data.clone()));
        })
    });
}

criterion_group!(
    benches,
    bench_submit_encode,
    bench_commit_decode,
    bench_snapshot_encode_1000,
    bench_peer_info_new,
    bench_sequencer_submit_rebased,
    bench_session_remote_over_pending,
    bench_broadcast_raw_100_peers,
);
criterion_main!(benches);
