use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_collab::{
    BroadcastGroup, ClientMessage, Cursor, DocumentHandle, MemoryStore, PresenceTable,
    ServerMessage, SessionConfig, DEFAULT_PALETTE,
};
use tandem_core::{CommittedOperation, Edit, Operation};
use uuid::Uuid;

fn bench_submit_encode(c: &mut Criterion) {
    c.bench_function("submit_encode", |b| {
        b.iter(|| {
            let msg = ClientMessage::Submit {
                edit: black_box(Edit::insert(1024, "typed")),
                base_revision: black_box(512),
            };
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_remote_decode(c: &mut Criterion) {
    let encoded = ServerMessage::Remote(CommittedOperation {
        revision: 513,
        operation: Operation::insert(1024, "typed", "alice", 512),
    })
    .encode()
    .unwrap();

    c.bench_function("remote_decode", |b| {
        b.iter(|| {
            black_box(ServerMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let group = BroadcastGroup::new(2048);
    let mut receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let op = CommittedOperation {
        revision: 1,
        operation: Operation::insert(0, "x", "alice", 0),
    };

    c.bench_function("broadcast_1k_to_100", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                group.send_committed(op.clone());
            }
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_cursor_mapping(c: &mut Criterion) {
    let mut table = PresenceTable::new(DEFAULT_PALETTE.to_vec(), Duration::from_secs(60));
    let now = Instant::now();
    for i in 0..50 {
        let user = format!("user-{i}").into();
        table.join(user, 0, now);
    }
    let edit = Edit::insert(10, "abc");
    let author = "user-0".into();

    c.bench_function("map_50_cursors", |b| {
        b.iter(|| table.map_cursors(black_box(&edit), &author, 1))
    });
}

fn bench_session_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let handle = rt.block_on(async {
        let doc_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let config = SessionConfig {
            idle_close_after: Duration::from_secs(3600),
            ..SessionConfig::default()
        };
        let handle = DocumentHandle::spawn(doc_id, store, config);
        handle.join("alice".into()).await.unwrap();
        handle
    });

    c.bench_function("session_submit_roundtrip", |b| {
        b.to_async(&rt).iter(|| async {
            let head = handle.stats().await.unwrap().revision;
            black_box(
                handle
                    .submit(Operation::insert(0, "k", "alice", head))
                    .await
                    .unwrap(),
            );
        })
    });

    c.bench_function("session_cursor_update", |b| {
        b.to_async(&rt).iter(|| async {
            let head = handle.stats().await.unwrap().revision;
            black_box(
                handle
                    .update_cursor("alice".into(), Cursor::at(0), head)
                    .await
                    .unwrap(),
            );
        })
    });
}

criterion_group!(
    benches,
    bench_submit_encode,
    bench_remote_decode,
    bench_broadcast_fanout,
    bench_cursor_mapping,
    bench_session_submit,
);
criterion_main!(benches);
