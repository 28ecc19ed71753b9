use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dfsync::checksum::checksum;
use dfsync::config::ClientId;
use dfsync::conflict::{resolve, Direction};
use dfsync::locks::LockTable;
use dfsync::protocol::{ClientFrame, FileVersion};
use std::sync::Arc;

fn bench_lock_acquire_release(c: &mut Criterion) {
    let table = LockTable::new();
    let client = ClientId::new("bench-client");

    c.bench_function("lock_acquire_release", |b| {
        b.iter(|| {
            assert!(table.acquire(black_box("file.txt"), &client));
            assert!(table.release(black_box("file.txt"), &client));
        })
    });
}

fn bench_lock_denied(c: &mut Criterion) {
    let table = LockTable::new();
    let owner = ClientId::new("owner");
    let other = ClientId::new("other");
    table.acquire("busy.txt", &owner);

    c.bench_function("lock_denied", |b| {
        b.iter(|| black_box(table.acquire(black_box("busy.txt"), &other)))
    });
}

fn bench_lock_contended_4_threads(c: &mut Criterion) {
    let table = Arc::new(LockTable::new());
    let clients: Vec<_> = (0..4).map(|i| ClientId::new(format!("c{i}"))).collect();

    c.bench_function("lock_contended_4_threads_1000_files", |b| {
        b.iter(|| {
            std::thread::scope(|s| {
                for client in &clients {
                    let table = &table;
                    s.spawn(move || {
                        for f in 0..250 {
                            let name = format!("f{f}");
                            if table.acquire(&name, client) {
                                table.release_or_delete(&name, client, f % 2 == 0);
                            }
                        }
                    });
                }
            });
        })
    });
}

fn bench_resolve(c: &mut Criterion) {
    let server = FileVersion {
        checksum: 0x1234_5678,
        mtime: 1_700_000_000,
    };
    let client = FileVersion {
        checksum: 0x8765_4321,
        mtime: 1_700_000_100,
    };

    c.bench_function("conflict_resolve", |b| {
        b.iter(|| black_box(resolve(Direction::Store, black_box(Some(server)), black_box(client))))
    });
}

fn bench_checksum_4k(c: &mut Criterion) {
    let data = vec![0xABu8; 4096];
    c.bench_function("checksum_4KiB", |b| b.iter(|| black_box(checksum(black_box(&data)))));
}

fn bench_chunk_frame_encode(c: &mut Criterion) {
    let frame = ClientFrame::Chunk(vec![7u8; 4096]);
    c.bench_function("chunk_frame_encode_4KiB", |b| {
        b.iter(|| black_box(frame.encode().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_lock_acquire_release,
    bench_lock_denied,
    bench_lock_contended_4_threads,
    bench_resolve,
    bench_checksum_4k,
    bench_chunk_frame_encode,
);
criterion_main!(benches);
