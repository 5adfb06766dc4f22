use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rhizo_common::types::{DirectoryEntry, EntryKind, FileAttributes, Timestamp, CHUNK_SIZE};
use rhizo_common::wire::{Operation, Request, Response};

fn bench_stat_request_encode(c: &mut Criterion) {
    let req = Request::new(Operation::Stat).with_path("/srv/data/some/nested/file.txt");

    c.bench_function("stat_request_encode", |b| {
        b.iter(|| black_box(req.encode().unwrap()));
    });
}

fn bench_attributes_response_decode(c: &mut Criterion) {
    let req = Request::new(Operation::Stat).with_path("/a");
    let mut resp = Response::to(&req);
    resp.attributes = Some(FileAttributes {
        size: 4096,
        mode: 0o100_644,
        uid: 1000,
        gid: 1000,
        atime: Timestamp::new(1_700_000_000, 1),
        mtime: Timestamp::new(1_700_000_000, 2),
        ctime: Timestamp::new(1_700_000_000, 3),
        nlink: 1,
        inode: 42,
    });
    let bytes = resp.encode().unwrap();

    c.bench_function("attributes_response_decode", |b| {
        b.iter(|| black_box(Response::decode(&bytes).unwrap()));
    });
}

fn bench_readdir_response_decode(c: &mut Criterion) {
    let req = Request::new(Operation::ReadDir).with_path("/");
    let mut resp = Response::to(&req);
    resp.entries = (0..1000)
        .map(|i| DirectoryEntry {
            name: format!("entry-{i:04}.dat"),
            kind: EntryKind::File,
        })
        .collect();
    let bytes = resp.encode().unwrap();

    c.bench_function("readdir_1000_decode", |b| {
        b.iter(|| black_box(Response::decode(&bytes).unwrap()));
    });
}

fn bench_chunk_roundtrip(c: &mut Criterion) {
    let req = Request::new(Operation::TransferChunk)
        .with_transfer(7)
        .with_offset(0)
        .with_payload(vec![0xAB; CHUNK_SIZE]);

    c.bench_function("transfer_chunk_256kb_roundtrip", |b| {
        b.iter(|| {
            let bytes = req.encode().unwrap();
            black_box(Request::decode(&bytes).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_stat_request_encode,
    bench_attributes_response_decode,
    bench_readdir_response_decode,
    bench_chunk_roundtrip,
);
criterion_main!(benches);
